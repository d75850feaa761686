//! Caste configuration.
//!
//! A caste is a named pool of workers sharing a specialization and
//! population bounds. Castes are loaded once at startup.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasteConfig {
    pub name: String,
    pub specialization: String,
    /// Agent types assigned round-robin by spawn index.
    pub agent_types: Vec<String>,
    pub min_count: usize,
    pub max_count: usize,
    /// Name of the metric the caste is primarily scaled on.
    #[serde(default = "default_scaling_metric")]
    pub scaling_metric: String,
}

fn default_scaling_metric() -> String {
    "utilization".to_string()
}

impl CasteConfig {
    pub fn new(name: &str, specialization: &str, agent_types: &[&str], min: usize, max: usize) -> Self {
        Self {
            name: name.to_string(),
            specialization: specialization.to_string(),
            agent_types: agent_types.iter().map(|s| s.to_string()).collect(),
            min_count: min,
            max_count: max,
            scaling_metric: default_scaling_metric(),
        }
    }

    /// Agent type for the worker spawned at `index`.
    pub fn agent_type_for(&self, index: usize) -> &str {
        if self.agent_types.is_empty() {
            return &self.specialization;
        }
        &self.agent_types[index % self.agent_types.len()]
    }

    pub fn allows(&self, count: usize) -> bool {
        (self.min_count..=self.max_count).contains(&count)
    }
}

/// The stock colony: one caste per routing keyword family.
pub fn default_castes() -> Vec<CasteConfig> {
    vec![
        CasteConfig::new("foragers", "research", &["researcher", "data-collector"], 2, 8),
        CasteConfig::new("builders", "implementation", &["coder", "architect"], 3, 15),
        CasteConfig::new("guardians", "quality", &["tester", "reviewer"], 2, 6),
        CasteConfig::new("nurses", "operations", &["deployer", "monitor"], 1, 4),
    ]
}

//! Task-to-caste routing.
//!
//! Routing consults an explicit `task type -> caste` table first. Types
//! missing from the table fall back to keyword matching on the lowercased
//! type:
//!
//! | keywords            | caste       |
//! |---------------------|-------------|
//! | `research`, `data`  | `foragers`  |
//! | `implement`, `code` | `builders`  |
//! | `test`, `review`    | `guardians` |
//! | `deploy`, `monitor` | `nurses`    |
//!
//! Anything else goes to `builders`. Keyword matching is a substring
//! heuristic and is checked in table order, so a type like
//! "code review" routes to `builders`.

use regex::Regex;
use std::collections::BTreeMap;
use tracing::trace;

use crate::core::task::Task;

/// Caste used when nothing matches.
pub const DEFAULT_CASTE: &str = "builders";

const KEYWORD_RULES: [(&str, &str); 4] = [
    ("research|data", "foragers"),
    ("implement|code", "builders"),
    ("test|review", "guardians"),
    ("deploy|monitor", "nurses"),
];

#[derive(Debug, Clone)]
pub struct CasteRouter {
    routes: BTreeMap<String, String>,
    rules: Vec<(Regex, String)>,
}

impl CasteRouter {
    pub fn new(routes: BTreeMap<String, String>) -> Self {
        let rules = KEYWORD_RULES
            .iter()
            .filter_map(|(pattern, caste)| {
                Regex::new(pattern)
                    .ok()
                    .map(|re| (re, caste.to_string()))
            })
            .collect();
        let routes = routes
            .into_iter()
            .map(|(kind, caste)| (kind.trim().to_lowercase(), caste))
            .collect();
        Self { routes, rules }
    }

    /// Pick the caste for a task.
    pub fn determine_optimal_caste(&self, task: &Task) -> String {
        self.route(&task.kind)
    }

    /// Pick the caste for a task type.
    pub fn route(&self, kind: &str) -> String {
        let key = kind.trim().to_lowercase();
        if let Some(caste) = self.routes.get(&key) {
            trace!(kind, caste = %caste, "routed by table");
            return caste.clone();
        }
        for (re, caste) in &self.rules {
            if re.is_match(&key) {
                trace!(kind, caste = %caste, "routed by keyword");
                return caste.clone();
            }
        }
        DEFAULT_CASTE.to_string()
    }
}

impl Default for CasteRouter {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

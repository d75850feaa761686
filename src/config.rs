use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::caste::{default_castes, CasteConfig};
use crate::core::task::Priority;
use crate::{Error, Result};

/// Top-level configuration, read from `~/.colony/colony.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_castes")]
    pub castes: Vec<CasteConfig>,
    /// Explicit `task type -> caste` routes, consulted before keyword matching.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            castes: default_castes(),
            routes: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            scaling: ScalingConfig::default(),
        }
    }
}

/// Defaults applied to task submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_priority: Priority,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
    pub default_estimated_secs: u64,
    /// Base retry backoff; the n-th retry waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: Priority::Medium,
            default_max_retries: 3,
            default_timeout_secs: 600,
            default_estimated_secs: 300,
            retry_backoff_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn default_estimated_duration(&self) -> Duration {
        Duration::from_secs(self.default_estimated_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Health check thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub ping_timeout_ms: u64,
    pub inactivity_threshold_secs: u64,
    pub min_success_rate: f64,
    pub max_response_time_ms: u64,
    /// Health records retained in the rolling window.
    pub history_limit: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            ping_timeout_ms: 2_000,
            inactivity_threshold_secs: 300,
            min_success_rate: 0.7,
            max_response_time_ms: 1_000,
            history_limit: 100,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }
}

/// Fault recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub restart_enabled: bool,
    pub failover_delay_ms: u64,
    /// Castes that keep a pool of standby workers.
    pub critical_castes: Vec<String>,
    pub backup_count: usize,
    /// Spawn a standby on demand when a caste's pool is empty.
    pub allow_lazy_backup: bool,
    /// Replace consumed standby workers right after activation.
    pub replenish_backups: bool,
    pub escalation_threshold: usize,
    pub escalation_window_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_enabled: true,
            failover_delay_ms: 1_000,
            critical_castes: vec!["builders".to_string()],
            backup_count: 1,
            allow_lazy_backup: true,
            replenish_backups: true,
            escalation_threshold: 2,
            escalation_window_secs: 300,
        }
    }
}

impl RecoveryConfig {
    pub fn failover_delay(&self) -> Duration {
        Duration::from_millis(self.failover_delay_ms)
    }

    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs)
    }

    pub fn is_critical(&self, caste: &str) -> bool {
        self.critical_castes.iter().any(|c| c == caste)
    }
}

/// Scaling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub interval_secs: u64,
    pub high_utilization: f64,
    pub low_utilization: f64,
    pub max_queue_depth: usize,
    pub min_queue_depth: usize,
    pub max_response_time_ms: f64,
    pub scale_factor: f64,
    pub cooldown_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            high_utilization: 0.8,
            low_utilization: 0.3,
            max_queue_depth: 15,
            min_queue_depth: 2,
            max_response_time_ms: 5_000.0,
            scale_factor: 1.5,
            cooldown_secs: 300,
        }
    }
}

impl ScalingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Config {
    pub fn colony_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".colony"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::colony_dir()?.join("colony.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::colony_dir()?.join("colony.log"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            castes = config.castes.len(),
            routes = config.routes.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::colony_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating colony directory");
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn caste(&self, name: &str) -> Option<&CasteConfig> {
        self.castes.iter().find(|c| c.name == name)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.castes.is_empty() {
            return Err(Error::Validation("at least one caste is required".to_string()));
        }

        let mut names = HashSet::new();
        for caste in &self.castes {
            if caste.name.trim().is_empty() {
                return Err(Error::Validation("caste name must not be empty".to_string()));
            }
            if !names.insert(caste.name.as_str()) {
                return Err(Error::Validation(format!("duplicate caste {}", caste.name)));
            }
            if caste.min_count > caste.max_count {
                return Err(Error::Validation(format!(
                    "caste {} has min_count {} above max_count {}",
                    caste.name, caste.min_count, caste.max_count
                )));
            }
            if caste.max_count == 0 {
                return Err(Error::Validation(format!(
                    "caste {} must allow at least one worker",
                    caste.name
                )));
            }
        }

        for (kind, caste) in &self.routes {
            if !names.contains(caste.as_str()) {
                return Err(Error::Validation(format!(
                    "route {} targets unknown caste {}",
                    kind, caste
                )));
            }
        }

        for caste in &self.recovery.critical_castes {
            if !names.contains(caste.as_str()) {
                return Err(Error::Validation(format!("unknown critical caste {}", caste)));
            }
        }

        if self.scaling.scale_factor <= 1.0 {
            return Err(Error::Validation(format!(
                "scale_factor must be greater than 1 (got {})",
                self.scaling.scale_factor
            )));
        }
        if self.scaling.low_utilization >= self.scaling.high_utilization {
            return Err(Error::Validation(
                "low_utilization must be below high_utilization".to_string(),
            ));
        }
        if self.scaling.min_queue_depth > self.scaling.max_queue_depth {
            return Err(Error::Validation(
                "min_queue_depth must not exceed max_queue_depth".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(Error::Validation(
                "min_success_rate must be within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}

//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A two-caste colony config with instant failover
//! - A probe whose answers can be scripted per worker
//! - A scheduler plus health monitor sharing one event channel

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use colony::config::Config;
use colony::core::{CasteConfig, TaskId, TaskSubmission, Worker, WorkerId, WorkerStatus};
use colony::orchestration::{
    channel, ColonyEvent, EventReceiver, HealthMonitor, Scheduler, WorkerProbe,
};
use colony::{Error, Result};

/// Builders (1..4, critical) and guardians (1..3), no failover delay.
pub fn colony_config() -> Config {
    let mut config = Config {
        castes: vec![
            CasteConfig::new("builders", "implementation", &["coder", "architect"], 1, 4),
            CasteConfig::new("guardians", "quality", &["tester"], 1, 3),
        ],
        ..Default::default()
    };
    config.recovery.failover_delay_ms = 0;
    config.recovery.critical_castes = vec!["builders".to_string()];
    config.recovery.backup_count = 1;
    config
}

/// Probe with scripted failures.
///
/// Workers marked down fail every ping. Workers given a flaky budget fail
/// that many pings and then answer normally.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashSet<WorkerId>>,
    flaky: Mutex<HashMap<WorkerId, usize>>,
}

impl ScriptedProbe {
    pub fn take_down(&self, id: &WorkerId) {
        self.down.lock().unwrap().insert(id.clone());
    }

    pub fn fail_times(&self, id: &WorkerId, times: usize) {
        self.flaky.lock().unwrap().insert(id.clone(), times);
    }
}

#[async_trait]
impl WorkerProbe for ScriptedProbe {
    async fn ping(&self, worker: &Worker) -> Result<Duration> {
        if self.down.lock().unwrap().contains(&worker.id) {
            return Err(Error::Validation("connection refused".to_string()));
        }
        let mut flaky = self.flaky.lock().unwrap();
        if let Some(left) = flaky.get_mut(&worker.id) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Validation("connection reset".to_string()));
            }
        }
        Ok(Duration::from_millis(2))
    }
}

/// Scheduler, monitor and probe wired to one event channel.
pub struct ColonyHarness {
    pub scheduler: Arc<RwLock<Scheduler>>,
    pub monitor: HealthMonitor,
    pub probe: Arc<ScriptedProbe>,
    pub events: EventReceiver,
}

impl ColonyHarness {
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Harness whose monitor reports escalated castes on the returned channel.
    pub fn with_emergencies(config: Config) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(config, Some(tx)), rx)
    }

    fn build(config: Config, emergency_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        let (tx, events) = channel();
        let mut scheduler = Scheduler::new(&config, tx.clone());
        scheduler.initialize().expect("initial workers should spawn");
        let scheduler = Arc::new(RwLock::new(scheduler));
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(
            scheduler.clone(),
            probe.clone(),
            config.health.clone(),
            config.recovery.clone(),
            tx,
        );
        let monitor = match emergency_tx {
            Some(emergency_tx) => monitor.with_emergency_channel(emergency_tx),
            None => monitor,
        };
        Self {
            scheduler,
            monitor,
            probe,
            events,
        }
    }

    pub async fn submit(&self, submission: TaskSubmission) -> TaskId {
        self.scheduler
            .write()
            .await
            .submit(submission)
            .expect("submission should be accepted")
    }

    /// First active worker of a caste in registration order.
    pub async fn active_worker(&self, caste: &str) -> WorkerId {
        let scheduler = self.scheduler.read().await;
        scheduler
            .registry()
            .workers()
            .into_iter()
            .find(|w| w.caste == caste && w.is_active())
            .map(|w| w.id.clone())
            .expect("caste should have an active worker")
    }

    pub async fn standbys(&self, caste: &str) -> Vec<WorkerId> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .registry()
            .workers()
            .into_iter()
            .filter(|w| w.caste == caste && w.status == WorkerStatus::Standby)
            .map(|w| w.id.clone())
            .collect()
    }

    /// Everything emitted so far.
    pub fn drain(&mut self) -> Vec<ColonyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn implementation(id: &str) -> TaskSubmission {
    TaskSubmission::new("implementation").with_id(id)
}

pub fn testing(id: &str) -> TaskSubmission {
    TaskSubmission::new("testing").with_id(id)
}

pub fn task_id(id: &str) -> TaskId {
    TaskId::from(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_spawns_initial_workers() {
        let harness = ColonyHarness::new(colony_config());
        let scheduler = harness.scheduler.read().await;
        assert_eq!(scheduler.registry().active_count("builders"), 1);
        assert_eq!(scheduler.registry().active_count("guardians"), 1);
        assert_eq!(scheduler.registry().standby_count("builders"), 1);
        assert_eq!(scheduler.registry().standby_count("guardians"), 0);
    }

    #[tokio::test]
    async fn test_scripted_probe_flaky_budget() {
        let harness = ColonyHarness::new(colony_config());
        let id = harness.active_worker("builders").await;
        harness.probe.fail_times(&id, 1);

        let worker = harness
            .scheduler
            .read()
            .await
            .registry()
            .get(&id)
            .cloned()
            .unwrap();
        assert!(harness.probe.ping(&worker).await.is_err());
        assert!(harness.probe.ping(&worker).await.is_ok());
    }
}

//! Health monitoring and fault recovery.
//!
//! The `HealthMonitor` pings every worker through a [`WorkerProbe`] and
//! judges the result against [`HealthConfig`]. Pings run concurrently with
//! no scheduler lock held. Unhealthy workers go through recovery:
//!
//! ```text
//! unhealthy -> restart -> reverify -> restored
//!                  \          \
//!                   +----------+-> backup activation -> replaced
//!                                        \
//!                                         +-> escalated
//! ```
//!
//! Each step is a separate short write-lock transition on the scheduler. The
//! registry's in-flight set keeps overlapping ticks from recovering the same
//! worker twice.
//!
//! Escalations are tracked per caste in a rolling window. Too many in the
//! window, or any in a critical caste, raise an emergency for the scaling
//! controller.

use crate::config::{HealthConfig, RecoveryConfig};
use crate::core::task::TaskId;
use crate::core::worker::{Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use crate::orchestration::events::{ColonyEvent, EventSender, RecoveryOutcome};
use crate::orchestration::scheduler::Scheduler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

/// Why a worker was judged unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssue {
    Unresponsive,
    Inactive,
    LowSuccessRate,
    SlowResponse,
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::Unresponsive => write!(f, "unresponsive"),
            HealthIssue::Inactive => write!(f, "inactive"),
            HealthIssue::LowSuccessRate => write!(f, "low_success_rate"),
            HealthIssue::SlowResponse => write!(f, "slow_response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub worker_id: WorkerId,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    /// Ping latency; `None` when the ping failed.
    pub response_time: Option<Duration>,
    pub last_seen: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Liveness check against a worker.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    /// Ping a worker and return the observed latency.
    async fn ping(&self, worker: &Worker) -> Result<Duration>;
}

/// Probe for in-process workers: always answers, instantly.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackProbe;

#[async_trait]
impl WorkerProbe for LoopbackProbe {
    async fn ping(&self, _worker: &Worker) -> Result<Duration> {
        Ok(Duration::ZERO)
    }
}

/// Rolling per-caste window of exhausted recoveries.
#[derive(Debug)]
pub struct EscalationTracker {
    window: Duration,
    failures: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl EscalationTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: HashMap::new(),
        }
    }

    /// Record a failure and return how many fall inside the window.
    pub fn record(&mut self, caste: &str, now: DateTime<Utc>) -> usize {
        let entries = self.failures.entry(caste.to_string()).or_default();
        entries.push_back(now);
        let window = self.window;
        while entries
            .front()
            .is_some_and(|t| (now - *t).to_std().is_ok_and(|age| age > window))
        {
            entries.pop_front();
        }
        entries.len()
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub records: Vec<HealthRecord>,
    pub recoveries: Vec<(WorkerId, RecoveryOutcome)>,
    pub discarded: Vec<WorkerId>,
    pub expired: Vec<TaskId>,
    /// Errored workers that answered again.
    pub revived: Vec<WorkerId>,
    /// Errored workers still down, with their replacements.
    pub replaced: Vec<(WorkerId, WorkerId)>,
}

pub struct HealthMonitor {
    scheduler: Arc<RwLock<Scheduler>>,
    probe: Arc<dyn WorkerProbe>,
    health: HealthConfig,
    recovery: RecoveryConfig,
    history: Mutex<HashMap<WorkerId, VecDeque<HealthRecord>>>,
    escalations: Mutex<EscalationTracker>,
    event_tx: EventSender,
    emergency_tx: Option<mpsc::UnboundedSender<String>>,
}

impl HealthMonitor {
    pub fn new(
        scheduler: Arc<RwLock<Scheduler>>,
        probe: Arc<dyn WorkerProbe>,
        health: HealthConfig,
        recovery: RecoveryConfig,
        event_tx: EventSender,
    ) -> Self {
        let window = recovery.escalation_window();
        Self {
            scheduler,
            probe,
            health,
            recovery,
            history: Mutex::new(HashMap::new()),
            escalations: Mutex::new(EscalationTracker::new(window)),
            event_tx,
            emergency_tx: None,
        }
    }

    /// Send escalated caste names to `tx`.
    pub fn with_emergency_channel(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.emergency_tx = Some(tx);
        self
    }

    /// Judge a worker from a ping result. Pure.
    pub fn evaluate(
        &self,
        worker: &Worker,
        ping: &Result<Duration>,
        now: DateTime<Utc>,
    ) -> HealthRecord {
        let mut issues = Vec::new();
        match ping {
            Err(_) => issues.push(HealthIssue::Unresponsive),
            Ok(latency) if *latency > self.health.max_response_time() => {
                issues.push(HealthIssue::SlowResponse)
            }
            Ok(_) => {}
        }
        let idle = worker.status != WorkerStatus::Working && !worker.is_standby();
        if idle && worker.idle_duration(now) > self.health.inactivity_threshold() {
            issues.push(HealthIssue::Inactive);
        }
        if worker.performance.success_rate < self.health.min_success_rate {
            issues.push(HealthIssue::LowSuccessRate);
        }
        issues.sort();

        HealthRecord {
            worker_id: worker.id.clone(),
            healthy: issues.is_empty(),
            issues,
            response_time: ping.as_ref().ok().copied(),
            last_seen: worker.performance.last_active,
            timestamp: now,
        }
    }

    /// Ping one worker under the configured timeout and evaluate it.
    pub async fn check_worker(&self, worker: &Worker) -> HealthRecord {
        let timeout = self.health.ping_timeout();
        let ping = match tokio::time::timeout(timeout, self.probe.ping(worker)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };
        trace!(worker = %worker.id, ok = ping.is_ok(), "probe finished");
        self.evaluate(worker, &ping, Utc::now())
    }

    /// Check every worker that is not under recovery.
    pub async fn check_all(&self) -> Vec<HealthRecord> {
        self.probe_all()
            .await
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    async fn probe_all(&self) -> Vec<(Worker, HealthRecord)> {
        let (workers, known): (Vec<Worker>, HashSet<WorkerId>) = {
            let scheduler = self.scheduler.read().await;
            let registry = scheduler.registry();
            let known = registry.workers().into_iter().map(|w| w.id.clone()).collect();
            let workers = registry
                .workers()
                .into_iter()
                .filter(|w| !registry.is_recovering(&w.id))
                .cloned()
                .collect();
            (workers, known)
        };

        let records = join_all(workers.iter().map(|w| self.check_worker(w))).await;

        self.history.lock().await.retain(|id, _| known.contains(id));
        for record in &records {
            self.remember(record.clone()).await;
            if !record.healthy {
                warn!(
                    worker = %record.worker_id,
                    issues = ?record.issues,
                    "worker unhealthy"
                );
                let _ = self.event_tx.send(ColonyEvent::HealthAlert {
                    worker_id: record.worker_id.clone(),
                    issues: record.issues.clone(),
                });
            }
        }
        debug!(checked = records.len(), "health check complete");
        workers.into_iter().zip(records).collect()
    }

    /// One monitor cycle: expire overdue tasks, check every worker, recover
    /// the unhealthy ones, and discard unresponsive standbys.
    ///
    /// Workers escalated on an earlier cycle are checked again: one that
    /// answers is revived, one that is still unresponsive is replaced by a
    /// fresh worker.
    pub async fn run_tick(&self) -> TickReport {
        let expired = {
            let mut scheduler = self.scheduler.write().await;
            let expired = scheduler.expire_overdue(Utc::now());
            scheduler.process_queue();
            expired
        };

        let checked = self.probe_all().await;
        let mut report = TickReport {
            expired,
            ..Default::default()
        };

        let mut to_recover = Vec::new();
        for (worker, record) in &checked {
            if worker.status == WorkerStatus::Error {
                self.reconsider_errored(worker, record, &mut report).await;
                continue;
            }
            if record.healthy {
                continue;
            }
            if worker.is_standby() {
                if record.issues.contains(&HealthIssue::Unresponsive) {
                    let discarded = self.scheduler.write().await.discard_standby(&worker.id);
                    match discarded {
                        Ok(()) => report.discarded.push(worker.id.clone()),
                        Err(e) => debug!(worker = %worker.id, error = %e, "standby kept"),
                    }
                }
                continue;
            }
            to_recover.push(worker.id.clone());
        }

        let outcomes = join_all(to_recover.iter().map(|id| self.initiate_recovery(id))).await;
        for (id, outcome) in to_recover.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => report.recoveries.push((id, outcome)),
                Err(Error::RecoveryInFlight(_)) => debug!(worker = %id, "recovery already running"),
                Err(e) => warn!(worker = %id, error = %e, "recovery failed"),
            }
        }

        report.records = checked.into_iter().map(|(_, record)| record).collect();
        report
    }

    async fn reconsider_errored(
        &self,
        worker: &Worker,
        record: &HealthRecord,
        report: &mut TickReport,
    ) {
        let mut scheduler = self.scheduler.write().await;
        if record.issues.contains(&HealthIssue::Unresponsive) {
            match scheduler.replace_errored(&worker.id) {
                Ok(fresh) => report.replaced.push((worker.id.clone(), fresh)),
                Err(e) => warn!(worker = %worker.id, error = %e, "errored worker not replaced"),
            }
        } else {
            match scheduler.revive_worker(&worker.id) {
                Ok(()) => report.revived.push(worker.id.clone()),
                Err(e) => debug!(worker = %worker.id, error = %e, "errored worker not revived"),
            }
        }
    }

    /// Recover one worker: restart and reverify, then a standby, then
    /// escalation.
    ///
    /// # Errors
    /// `RecoveryInFlight` if another recovery owns the worker.
    pub async fn initiate_recovery(&self, worker_id: &WorkerId) -> Result<RecoveryOutcome> {
        let (held, caste) = {
            let mut scheduler = self.scheduler.write().await;
            let caste = scheduler
                .registry()
                .get(worker_id)
                .map(|w| w.caste.clone())
                .ok_or_else(|| Error::WorkerNotFound(worker_id.clone()))?;
            (scheduler.begin_recovery(worker_id)?, caste)
        };
        info!(worker = %worker_id, caste = %caste, held = ?held, "recovery started");

        if self.recovery.restart_enabled {
            if let Some(outcome) = self.try_restart(worker_id, held.clone()).await? {
                return Ok(outcome);
            }
        }

        let backup = self
            .scheduler
            .write()
            .await
            .activate_backup(worker_id, held.clone());
        let reason = match backup {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e.to_string(),
        };

        let escalated = self
            .scheduler
            .write()
            .await
            .escalate(worker_id, held, &reason);
        match escalated {
            Ok(outcome) => {
                self.record_escalation(&caste).await;
                Ok(outcome)
            }
            Err(e) => {
                self.scheduler.write().await.abandon_recovery(worker_id);
                Err(e)
            }
        }
    }

    /// Restart after the failover delay and reverify. `Some` if the worker
    /// came back healthy.
    async fn try_restart(
        &self,
        worker_id: &WorkerId,
        held: Option<TaskId>,
    ) -> Result<Option<RecoveryOutcome>> {
        tokio::time::sleep(self.recovery.failover_delay()).await;

        let restarted = {
            let mut scheduler = self.scheduler.write().await;
            scheduler
                .restart_worker(worker_id)
                .map(|_| scheduler.registry().get(worker_id).cloned())
        };
        let worker = match restarted {
            Ok(Some(worker)) => worker,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "restart failed");
                return Ok(None);
            }
        };

        let record = self.check_worker(&worker).await;
        self.remember(record.clone()).await;
        if !record.healthy {
            debug!(worker = %worker_id, issues = ?record.issues, "reverify failed");
            return Ok(None);
        }
        let outcome = self
            .scheduler
            .write()
            .await
            .finish_restored(worker_id, held)?;
        Ok(Some(outcome))
    }

    async fn record_escalation(&self, caste: &str) {
        let failures = self.escalations.lock().await.record(caste, Utc::now());
        let critical = self.recovery.is_critical(caste);
        if failures <= self.recovery.escalation_threshold && !critical {
            return;
        }
        error!(caste, failures, critical, "caste escalated");
        let _ = self.event_tx.send(ColonyEvent::CasteEscalated {
            caste: caste.to_string(),
            failures,
        });
        if let Some(tx) = &self.emergency_tx {
            let _ = tx.send(caste.to_string());
        }
    }

    async fn remember(&self, record: HealthRecord) {
        let limit = self.health.history_limit.max(1);
        let mut history = self.history.lock().await;
        let entries = history.entry(record.worker_id.clone()).or_default();
        entries.push_back(record);
        while entries.len() > limit {
            entries.pop_front();
        }
    }

    /// Recorded checks for a worker, oldest first.
    pub async fn history(&self, worker_id: &WorkerId) -> Vec<HealthRecord> {
        self.history
            .lock()
            .await
            .get(worker_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

//! Worker registry and caste manager.
//!
//! The `WorkerRegistry` owns every worker, enforces each caste's
//! `[min_count, max_count]` bounds on active workers, keeps the standby
//! pool for critical castes, and tracks which workers are under recovery.
//! It emits spawn/remove events on the colony channel.
//!
//! Standby workers do not count toward a caste's bounds until activated.

use crate::config::RecoveryConfig;
use crate::core::caste::CasteConfig;
use crate::core::task::TaskId;
use crate::core::worker::{Performance, Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use crate::orchestration::events::{ColonyEvent, EventSender};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

/// Per-caste counts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CasteSummary {
    pub active: usize,
    pub standby: usize,
    pub idle: usize,
    pub working: usize,
    pub error: usize,
    pub min: usize,
    pub max: usize,
}

/// Registry-wide counts by caste and by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_caste: BTreeMap<String, CasteSummary>,
    pub by_status: BTreeMap<String, usize>,
}

/// Active worker count of a caste alongside its bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasteCount {
    pub name: String,
    pub current: usize,
    pub min: usize,
    pub max: usize,
}

/// Workers added and removed by a [`WorkerRegistry::scale_to`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleResult {
    pub spawned: Vec<WorkerId>,
    pub removed: Vec<WorkerId>,
}

#[derive(Debug)]
struct CasteState {
    config: CasteConfig,
    /// Spawn counter; feeds the agent type round-robin.
    spawned: usize,
}

pub struct WorkerRegistry {
    castes: BTreeMap<String, CasteState>,
    /// Caste names in configuration order.
    order: Vec<String>,
    workers: HashMap<WorkerId, Worker>,
    recovering: HashSet<WorkerId>,
    next_registration: u64,
    recovery: RecoveryConfig,
    event_tx: EventSender,
}

impl WorkerRegistry {
    pub fn new(castes: Vec<CasteConfig>, recovery: RecoveryConfig, event_tx: EventSender) -> Self {
        let order = castes.iter().map(|c| c.name.clone()).collect();
        let castes = castes
            .into_iter()
            .map(|config| (config.name.clone(), CasteState { config, spawned: 0 }))
            .collect();
        Self {
            castes,
            order,
            workers: HashMap::new(),
            recovering: HashSet::new(),
            next_registration: 0,
            recovery,
            event_tx,
        }
    }

    /// Spawn `min_count` workers per caste and fill the standby pools of
    /// critical castes.
    pub fn initialize(&mut self) -> Result<Vec<WorkerId>> {
        let mut spawned = Vec::new();
        for name in self.order.clone() {
            let min = self.caste_state(&name)?.config.min_count;
            while self.active_count(&name) < min {
                spawned.push(self.spawn_next(&name)?);
            }
            if self.recovery.is_critical(&name) {
                while self.standby_count(&name) < self.recovery.backup_count {
                    spawned.push(self.spawn_standby(&name)?);
                }
            }
        }
        info!(workers = spawned.len(), castes = self.order.len(), "registry initialized");
        Ok(spawned)
    }

    /// Spawn an idle worker, taking its agent type from `index`.
    ///
    /// # Errors
    /// `UnknownCaste`, or `CapacityBoundViolation` if the caste is at
    /// `max_count`.
    pub fn spawn_worker(&mut self, caste: &str, index: usize) -> Result<WorkerId> {
        let state = self.caste_state(caste)?;
        let (min, max) = (state.config.min_count, state.config.max_count);
        let attempted = self.active_count(caste) + 1;
        if attempted > max {
            return Err(Error::CapacityBoundViolation {
                caste: caste.to_string(),
                attempted,
                min,
                max,
            });
        }
        self.create(caste, index, WorkerStatus::Idle)
    }

    /// Spawn the next idle worker of a caste.
    pub fn spawn_next(&mut self, caste: &str) -> Result<WorkerId> {
        let index = self.caste_state(caste)?.spawned;
        self.spawn_worker(caste, index)
    }

    /// Spawn a standby worker. Standby workers sit outside the caste bounds.
    pub fn spawn_standby(&mut self, caste: &str) -> Result<WorkerId> {
        let index = self.caste_state(caste)?.spawned;
        self.create(caste, index, WorkerStatus::Standby)
    }

    fn create(&mut self, caste: &str, index: usize, status: WorkerStatus) -> Result<WorkerId> {
        let registration = self.next_registration;
        let state = self
            .castes
            .get_mut(caste)
            .ok_or_else(|| Error::UnknownCaste(caste.to_string()))?;
        state.spawned += 1;
        self.next_registration += 1;

        let id = WorkerId(format!("{}-{}", caste, registration));
        let worker = Worker {
            id: id.clone(),
            caste: caste.to_string(),
            agent_type: state.config.agent_type_for(index).to_string(),
            specialization: state.config.specialization.clone(),
            status,
            current_task: None,
            performance: Performance::new(Utc::now()),
            registration,
        };
        let standby = status == WorkerStatus::Standby;
        debug!(worker = %id, caste, agent_type = %worker.agent_type, standby, "worker spawned");
        self.workers.insert(id.clone(), worker);

        let _ = self.event_tx.send(ColonyEvent::WorkerSpawned {
            worker_id: id.clone(),
            caste: caste.to_string(),
            standby,
        });
        Ok(id)
    }

    /// Remove a worker that is not working.
    ///
    /// # Errors
    /// `WorkerNotFound`, `WorkerBusy` if it holds a task, `RecoveryInFlight`
    /// if recovery owns it, or `CapacityBoundViolation` if removing an
    /// active worker would drop the caste below `min_count`.
    pub fn remove_worker(&mut self, id: &WorkerId) -> Result<Worker> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        if worker.status == WorkerStatus::Working {
            return Err(Error::WorkerBusy(id.clone()));
        }
        if self.recovering.contains(id) {
            return Err(Error::RecoveryInFlight(id.clone()));
        }
        if worker.is_active() {
            let caste = worker.caste.clone();
            let config = &self.caste_state(&caste)?.config;
            let (min, max) = (config.min_count, config.max_count);
            let current = self.active_count(&caste);
            if current <= min {
                return Err(Error::CapacityBoundViolation {
                    caste,
                    attempted: current.saturating_sub(1),
                    min,
                    max,
                });
            }
        }
        self.detach(id)
    }

    fn detach(&mut self, id: &WorkerId) -> Result<Worker> {
        let worker = self
            .workers
            .remove(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        info!(worker = %id, caste = %worker.caste, "worker removed");
        let _ = self.event_tx.send(ColonyEvent::WorkerRemoved {
            worker_id: id.clone(),
            caste: worker.caste.clone(),
        });
        Ok(worker)
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers in registration order.
    pub fn workers(&self) -> Vec<&Worker> {
        let mut all: Vec<&Worker> = self.workers.values().collect();
        all.sort_by_key(|w| w.registration);
        all
    }

    pub fn caste_config(&self, name: &str) -> Option<&CasteConfig> {
        self.castes.get(name).map(|s| &s.config)
    }

    pub fn caste_names(&self) -> &[String] {
        &self.order
    }

    pub fn recovery_config(&self) -> &RecoveryConfig {
        &self.recovery
    }

    pub fn active_count(&self, caste: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.caste == caste && w.is_active())
            .count()
    }

    pub fn standby_count(&self, caste: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.caste == caste && w.is_standby())
            .count()
    }

    pub fn working_count(&self, caste: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.caste == caste && w.status == WorkerStatus::Working)
            .count()
    }

    /// The best idle worker of a caste: highest success rate, earliest
    /// registration on ties. Workers under recovery are never offered.
    pub fn find_available_worker(&self, caste: &str) -> Option<&Worker> {
        self.workers
            .values()
            .filter(|w| w.caste == caste && w.is_idle() && !self.recovering.contains(&w.id))
            .fold(None, |best: Option<&Worker>, candidate| match best {
                None => Some(candidate),
                Some(current) => {
                    let better_rate =
                        candidate.performance.success_rate > current.performance.success_rate;
                    let tie = candidate.performance.success_rate
                        == current.performance.success_rate
                        && candidate.registration < current.registration;
                    if better_rate || tie {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            })
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            total: self.workers.len(),
            ..Default::default()
        };
        for name in &self.order {
            if let Some(state) = self.castes.get(name) {
                summary.by_caste.insert(
                    name.clone(),
                    CasteSummary {
                        min: state.config.min_count,
                        max: state.config.max_count,
                        ..Default::default()
                    },
                );
            }
        }
        for worker in self.workers.values() {
            *summary.by_status.entry(worker.status.to_string()).or_insert(0) += 1;
            let entry = summary.by_caste.entry(worker.caste.clone()).or_default();
            match worker.status {
                WorkerStatus::Idle => entry.idle += 1,
                WorkerStatus::Working => entry.working += 1,
                WorkerStatus::Standby => entry.standby += 1,
                WorkerStatus::Error => entry.error += 1,
            }
            if worker.is_active() {
                entry.active += 1;
            }
        }
        summary
    }

    pub fn caste_counts(&self) -> Vec<CasteCount> {
        self.order
            .iter()
            .filter_map(|name| {
                let config = &self.castes.get(name)?.config;
                Some(CasteCount {
                    name: name.clone(),
                    current: self.active_count(name),
                    min: config.min_count,
                    max: config.max_count,
                })
            })
            .collect()
    }

    // ========== Assignment ==========

    /// Bind an idle worker to a task.
    pub fn assign(&mut self, id: &WorkerId, task: TaskId, now: DateTime<Utc>) -> Result<()> {
        let worker = self.worker_mut(id)?;
        if worker.status != WorkerStatus::Idle {
            return Err(Error::WorkerBusy(id.clone()));
        }
        worker.status = WorkerStatus::Working;
        worker.current_task = Some(task);
        worker.performance.last_active = now;
        Ok(())
    }

    /// Free a worker after its task finished and fold in the outcome.
    pub fn release(
        &mut self,
        id: &WorkerId,
        success: bool,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let worker = self.worker_mut(id)?;
        if worker.status == WorkerStatus::Working {
            worker.status = WorkerStatus::Idle;
        }
        worker.current_task = None;
        worker.performance.record(success, duration, now);
        Ok(())
    }

    /// Free a worker without recording an outcome (cancellation).
    pub fn release_untracked(&mut self, id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let worker = self.worker_mut(id)?;
        if worker.status == WorkerStatus::Working {
            worker.status = WorkerStatus::Idle;
        }
        worker.current_task = None;
        worker.performance.last_active = now;
        Ok(())
    }

    /// Record a liveness signal from the runtime.
    pub fn heartbeat(&mut self, id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        self.worker_mut(id)?.performance.last_active = now;
        Ok(())
    }

    // ========== Recovery ==========

    /// Claim a worker for recovery.
    ///
    /// # Errors
    /// `RecoveryInFlight` if another recovery already owns it.
    pub fn begin_recovery(&mut self, id: &WorkerId) -> Result<()> {
        if !self.workers.contains_key(id) {
            return Err(Error::WorkerNotFound(id.clone()));
        }
        if !self.recovering.insert(id.clone()) {
            return Err(Error::RecoveryInFlight(id.clone()));
        }
        Ok(())
    }

    pub fn end_recovery(&mut self, id: &WorkerId) {
        self.recovering.remove(id);
    }

    pub fn is_recovering(&self, id: &WorkerId) -> bool {
        self.recovering.contains(id)
    }

    /// Reset a worker to idle, dropping its current task.
    /// Returns the task it held.
    pub fn restart(&mut self, id: &WorkerId, now: DateTime<Utc>) -> Result<Option<TaskId>> {
        let worker = self.worker_mut(id)?;
        let held = worker.current_task.take();
        worker.status = WorkerStatus::Idle;
        worker.performance.last_active = now;
        info!(worker = %id, "worker restarted");
        Ok(held)
    }

    pub fn mark_error(&mut self, id: &WorkerId) -> Result<Option<TaskId>> {
        let worker = self.worker_mut(id)?;
        worker.status = WorkerStatus::Error;
        Ok(worker.current_task.take())
    }

    /// Put an errored worker that answers again back to idle.
    pub fn revive(&mut self, id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let worker = self.worker_mut(id)?;
        if worker.status != WorkerStatus::Error {
            return Err(Error::Validation(format!("worker {} is not in error", id)));
        }
        worker.status = WorkerStatus::Idle;
        worker.performance.last_active = now;
        info!(worker = %id, "worker revived");
        Ok(())
    }

    /// Retire an errored worker and spawn a fresh one of the same caste in
    /// its place. The caste's active count is unchanged.
    pub fn replace_errored(&mut self, id: &WorkerId) -> Result<WorkerId> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        if worker.status != WorkerStatus::Error {
            return Err(Error::Validation(format!("worker {} is not in error", id)));
        }
        if self.recovering.contains(id) {
            return Err(Error::RecoveryInFlight(id.clone()));
        }
        let caste = worker.caste.clone();
        self.detach(id)?;
        self.spawn_next(&caste)
    }

    /// Oldest standby worker of a caste.
    pub fn take_standby(&self, caste: &str) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.caste == caste && w.is_standby())
            .min_by_key(|w| w.registration)
            .map(|w| w.id.clone())
    }

    /// Retire `failed` and put the standby `backup` in its place, handing it
    /// `task` if one is given. The caste's active count is unchanged.
    pub fn replace_worker(
        &mut self,
        failed: &WorkerId,
        backup: &WorkerId,
        task: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        let failed_caste = self
            .workers
            .get(failed)
            .map(|w| w.caste.clone())
            .ok_or_else(|| Error::WorkerNotFound(failed.clone()))?;
        let backup_worker = self
            .workers
            .get(backup)
            .ok_or_else(|| Error::WorkerNotFound(backup.clone()))?;
        if !backup_worker.is_standby() || backup_worker.caste != failed_caste {
            return Err(Error::Validation(format!(
                "worker {} is not a standby of caste {}",
                backup, failed_caste
            )));
        }

        self.recovering.remove(failed);
        let retired = self.detach(failed)?;

        let worker = self.worker_mut(backup)?;
        worker.status = if task.is_some() {
            WorkerStatus::Working
        } else {
            WorkerStatus::Idle
        };
        worker.current_task = task;
        worker.performance.last_active = now;
        info!(failed = %failed, backup = %backup, caste = %failed_caste, "standby activated");
        Ok(retired)
    }

    // ========== Scaling ==========

    /// Move a caste's active count toward `target`.
    ///
    /// Scale-down removes errored workers first, then idle workers with the
    /// lowest success rate, newest first. Busy workers are never removed, so
    /// the result may stop short of `target`.
    ///
    /// # Errors
    /// `CapacityBoundViolation` if `target` is outside the caste bounds.
    pub fn scale_to(&mut self, caste: &str, target: usize) -> Result<ScaleResult> {
        let config = &self.caste_state(caste)?.config;
        let (min, max) = (config.min_count, config.max_count);
        if !config.allows(target) {
            return Err(Error::CapacityBoundViolation {
                caste: caste.to_string(),
                attempted: target,
                min,
                max,
            });
        }

        let mut result = ScaleResult::default();
        let current = self.active_count(caste);
        if target > current {
            for _ in current..target {
                result.spawned.push(self.spawn_next(caste)?);
            }
        } else if target < current {
            let mut candidates: Vec<&Worker> = self
                .workers
                .values()
                .filter(|w| {
                    w.caste == caste
                        && matches!(w.status, WorkerStatus::Idle | WorkerStatus::Error)
                        && !self.recovering.contains(&w.id)
                })
                .collect();
            candidates.sort_by(|a, b| {
                let a_err = a.status == WorkerStatus::Error;
                let b_err = b.status == WorkerStatus::Error;
                b_err
                    .cmp(&a_err)
                    .then(
                        a.performance
                            .success_rate
                            .partial_cmp(&b.performance.success_rate)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(b.registration.cmp(&a.registration))
            });
            let victims: Vec<WorkerId> = candidates
                .into_iter()
                .take(current - target)
                .map(|w| w.id.clone())
                .collect();
            for id in victims {
                self.detach(&id)?;
                result.removed.push(id);
            }
        }
        Ok(result)
    }

    fn caste_state(&self, caste: &str) -> Result<&CasteState> {
        self.castes
            .get(caste)
            .ok_or_else(|| Error::UnknownCaste(caste.to_string()))
    }

    fn worker_mut(&mut self, id: &WorkerId) -> Result<&mut Worker> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))
    }
}

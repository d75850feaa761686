//! Dependency-aware task scheduler.
//!
//! The `Scheduler` owns the task graph, the ready queue, and the worker
//! registry. Every mutation of task or worker state goes through one of its
//! methods, and callers share it behind a single `tokio::sync::RwLock`, so a
//! transition is never observed half-done.
//!
//! Task lifecycle:
//!
//! ```text
//! waiting -> queued -> executing -> completed
//!    ^         ^          |  \
//!    |         +-- retry -+   +-> failed / cancelled
//!    +-- dependencies regressed
//! ```
//!
//! Every assignment bumps the task's epoch. Completion and failure reports
//! may carry the epoch they were issued for; a report with an older epoch is
//! discarded.

use crate::config::{Config, SchedulerConfig};
use crate::core::dag::TaskGraph;
use crate::core::task::{Task, TaskId, TaskNode, TaskStatus, TaskSubmission};
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use crate::orchestration::events::{ColonyEvent, EventSender, RecoveryOutcome};
use crate::orchestration::queue::ReadyQueue;
use crate::orchestration::registry::{ScaleResult, WorkerRegistry};
use crate::orchestration::router::CasteRouter;
use crate::orchestration::scaling::{ScalingAction, ScalingDecision};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Read-only aggregate view of the task graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistributionAnalytics {
    pub total: usize,
    pub waiting: usize,
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean assignment-to-completion time of completed tasks.
    pub average_duration_secs: f64,
    /// Completed over completed plus failed; 0 when nothing has finished.
    pub success_rate: f64,
    pub by_type: BTreeMap<String, usize>,
    /// Assignments handed to each worker, including retries and transfers.
    pub by_worker: BTreeMap<String, u64>,
}

/// What `cancel_task` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    /// The task was never assigned and has been removed.
    Removed,
    /// The task is executing; the runtime must stop it and acknowledge.
    Requested { worker: WorkerId, epoch: u64 },
}

pub struct Scheduler {
    graph: TaskGraph,
    queue: ReadyQueue,
    registry: WorkerRegistry,
    router: CasteRouter,
    config: SchedulerConfig,
    /// Ids of removed tasks. Never reused.
    retired_ids: HashSet<TaskId>,
    assignments: HashMap<WorkerId, u64>,
    event_tx: EventSender,
}

impl Scheduler {
    pub fn new(config: &Config, event_tx: EventSender) -> Self {
        Self {
            graph: TaskGraph::new(),
            queue: ReadyQueue::new(),
            registry: WorkerRegistry::new(
                config.castes.clone(),
                config.recovery.clone(),
                event_tx.clone(),
            ),
            router: CasteRouter::new(config.routes.clone()),
            config: config.scheduler.clone(),
            retired_ids: HashSet::new(),
            assignments: HashMap::new(),
            event_tx,
        }
    }

    /// Spawn the initial worker population.
    pub fn initialize(&mut self) -> Result<Vec<WorkerId>> {
        self.registry.initialize()
    }

    // ========== Accessors ==========

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn router(&self) -> &CasteRouter {
        &self.router
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.graph.get(id)
    }

    pub fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.graph.get(id).map(|n| &n.status)
    }

    /// Ready-queue contents in dequeue order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.queue.ids()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued tasks per caste they would route to.
    /// Every configured caste is present, with 0 when nothing waits for it.
    pub fn queue_depth_by_caste(&self) -> BTreeMap<String, usize> {
        let mut depth: BTreeMap<String, usize> = self
            .registry
            .caste_names()
            .iter()
            .map(|caste| (caste.clone(), 0))
            .collect();
        for entry in self.queue.iter() {
            if let Some(node) = self.graph.get(&entry.task_id) {
                *depth
                    .entry(self.router.determine_optimal_caste(&node.task))
                    .or_insert(0) += 1;
            }
        }
        depth
    }

    /// Mean time ready tasks wait for a worker: the running wait of queued
    /// tasks plus the recorded wait of executing ones. Zero when there are none.
    pub fn average_queue_wait(&self, now: DateTime<Utc>) -> Duration {
        let waits: Vec<Duration> = self
            .graph
            .nodes()
            .filter_map(|node| match node.status {
                TaskStatus::Queued => node.ready_wait(now),
                TaskStatus::Executing => node.queue_wait,
                _ => None,
            })
            .collect();
        if waits.is_empty() {
            return Duration::ZERO;
        }
        waits.iter().sum::<Duration>() / waits.len() as u32
    }

    /// Record a liveness signal from a worker.
    pub fn heartbeat(&mut self, worker: &WorkerId, at: DateTime<Utc>) -> Result<()> {
        self.registry.heartbeat(worker, at)
    }

    // ========== Submission ==========

    /// Validate a submission and insert it into the graph.
    ///
    /// The task is queued right away if its dependencies are all completed.
    /// A dependency that already failed or was cancelled blocks it at once.
    ///
    /// # Errors
    /// `Validation` for an empty type, a reused id, an unknown or self
    /// dependency, or a cycle. The graph is unchanged on error.
    pub fn add_task(&mut self, submission: TaskSubmission) -> Result<TaskId> {
        if let Some(id) = &submission.id {
            if self.retired_ids.contains(id) {
                return Err(Error::Validation(format!("task id {} was already used", id)));
            }
        }
        let task = Task::from_submission(submission, &self.config)?;
        let id = task.id.clone();
        let priority = task.priority;
        let kind = task.kind.clone();
        let dependencies = task.dependencies.clone();
        self.graph.insert(task)?;

        let blocked_by = dependencies.iter().find(|dep| {
            self.graph
                .get(dep)
                .map(|n| matches!(n.status, TaskStatus::Failed { .. } | TaskStatus::Cancelled))
                .unwrap_or(false)
        });
        if let Some(upstream) = blocked_by.cloned() {
            let reason = "upstream failure";
            if let Some(node) = self.graph.get_mut(&id) {
                node.fail(reason, Utc::now());
                node.last_error = Some(reason.to_string());
            }
            warn!(task = %id, upstream = %upstream, "task blocked at submission");
            let _ = self.event_tx.send(ColonyEvent::TaskBlocked {
                task_id: id.clone(),
                upstream,
                reason: reason.to_string(),
            });
            return Ok(id);
        }

        if self.graph.dependencies_satisfied(&id) {
            if let Some(node) = self.graph.get_mut(&id) {
                node.enqueue(Utc::now());
            }
            self.queue.insert(id.clone(), priority);
        }
        info!(task = %id, kind = %kind, priority = %priority, deps = dependencies.len(), "task added");
        Ok(id)
    }

    /// `add_task` followed by a queue pass.
    pub fn submit(&mut self, submission: TaskSubmission) -> Result<TaskId> {
        let id = self.add_task(submission)?;
        self.process_queue();
        Ok(id)
    }

    // ========== Assignment ==========

    /// Assign queued tasks to idle workers, in queue order.
    ///
    /// A caste with no idle worker is skipped for the rest of the pass, so
    /// one saturated caste never holds back another. Returns the number of
    /// tasks assigned.
    pub fn process_queue(&mut self) -> usize {
        self.process_queue_at(Utc::now())
    }

    fn process_queue_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut exhausted: HashSet<String> = HashSet::new();
        let mut assigned = 0;

        for id in self.queue.ids() {
            let Some(node) = self.graph.get(&id) else {
                self.queue.remove(&id);
                continue;
            };
            if node.not_before.is_some_and(|gate| gate > now) {
                continue;
            }
            if !self.graph.dependencies_satisfied(&id) {
                warn!(task = %id, "queued task lost its dependencies, returning to waiting");
                self.queue.remove(&id);
                if let Some(node) = self.graph.get_mut(&id) {
                    node.wait();
                }
                continue;
            }

            let caste = self.router.determine_optimal_caste(&node.task);
            if exhausted.contains(&caste) {
                continue;
            }
            let Some(worker) = self.registry.find_available_worker(&caste) else {
                if self.registry.caste_config(&caste).is_none() {
                    warn!(task = %id, caste = %caste, "task routed to unconfigured caste");
                } else {
                    debug!(caste = %caste, "no idle worker");
                }
                exhausted.insert(caste);
                continue;
            };
            let worker_id = worker.id.clone();
            let agent_type = worker.agent_type.clone();

            if let Err(e) = self.registry.assign(&worker_id, id.clone(), now) {
                warn!(worker = %worker_id, error = %e, "assignment refused");
                exhausted.insert(caste);
                continue;
            }
            self.queue.remove(&id);
            let Some(node) = self.graph.get_mut(&id) else {
                continue;
            };
            let epoch = node.start(worker_id.clone(), now);
            let estimated_completion = node.estimated_completion();
            *self.assignments.entry(worker_id.clone()).or_insert(0) += 1;

            info!(task = %id, worker = %worker_id, caste = %caste, epoch, "task assigned");
            let _ = self.event_tx.send(ColonyEvent::TaskAssigned {
                task_id: id,
                worker_id,
                caste,
                agent_type,
                epoch,
                estimated_completion,
            });
            assigned += 1;
        }
        assigned
    }

    // ========== Completion ==========

    /// Complete a task for its current assignment.
    pub fn complete_task(&mut self, id: &TaskId, result: serde_json::Value) -> Result<()> {
        let epoch = self.current_epoch(id)?;
        self.complete_with_epoch(id, epoch, result)
    }

    /// Complete a task, rejecting reports from a superseded assignment.
    ///
    /// # Errors
    /// `TaskNotFound`, `InvalidTransition` unless the task is executing, or
    /// `StaleAssignment` if `epoch` is not the current one.
    pub fn complete_with_epoch(
        &mut self,
        id: &TaskId,
        epoch: u64,
        result: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        self.check_report(id, epoch, "completed")?;
        let Some(node) = self.graph.get_mut(id) else {
            return Err(Error::TaskNotFound(id.clone()));
        };
        let worker = node.assigned_worker.clone();
        node.complete(result, now);
        node.cancel_requested = false;
        let duration = node.duration().unwrap_or_default();

        if let Some(worker) = &worker {
            self.release_worker(worker, id, Some((true, duration)), now)?;
            info!(task = %id, worker = %worker, secs = duration.as_secs_f64(), "task completed");
            let _ = self.event_tx.send(ColonyEvent::TaskCompleted {
                task_id: id.clone(),
                worker_id: worker.clone(),
            });
        }
        self.process_dependents(id);
        Ok(())
    }

    /// Queue the waiting dependents of `id` whose dependencies are now all
    /// completed, then run a queue pass. Returns the promoted ids.
    pub fn process_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let now = Utc::now();
        let mut promoted = Vec::new();
        for dependent in self.graph.dependents(id) {
            let ready = self
                .graph
                .get(&dependent)
                .map(|n| n.status == TaskStatus::Waiting)
                .unwrap_or(false)
                && self.graph.dependencies_satisfied(&dependent);
            if !ready {
                continue;
            }
            if let Some(node) = self.graph.get_mut(&dependent) {
                node.enqueue(now);
                let priority = node.task.priority;
                self.queue.insert(dependent.clone(), priority);
                debug!(task = %dependent, upstream = %id, "dependent queued");
                promoted.push(dependent);
            }
        }
        self.process_queue();
        promoted
    }

    // ========== Failure ==========

    /// Fail a task for its current assignment.
    pub fn fail_task(&mut self, id: &TaskId, error: &str) -> Result<()> {
        let epoch = self.current_epoch(id)?;
        self.fail_with_epoch(id, epoch, error)
    }

    /// Fail a task, rejecting reports from a superseded assignment.
    ///
    /// The task is re-queued while it has retries left, gated by
    /// `retry_backoff * retries`. Otherwise it fails along with every
    /// transitive dependent.
    pub fn fail_with_epoch(&mut self, id: &TaskId, epoch: u64, error: &str) -> Result<()> {
        self.fail_at(id, epoch, error, Utc::now())
    }

    fn fail_at(&mut self, id: &TaskId, epoch: u64, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.check_report(id, epoch, "failed")?;
        let backoff = self.config.retry_backoff();
        let Some(node) = self.graph.get_mut(id) else {
            return Err(Error::TaskNotFound(id.clone()));
        };
        if node.cancel_requested {
            debug!(task = %id, error, "failure of a task being cancelled");
            self.finish_cancel(id, now)?;
            return Ok(());
        }
        let worker = node.assigned_worker.clone();
        let elapsed = node
            .start_time
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default();
        node.retries += 1;
        node.last_error = Some(error.to_string());
        node.cancel_requested = false;
        let retries = node.retries;
        let max_retries = node.task.max_retries;
        let priority = node.task.priority;

        if retries < max_retries {
            node.enqueue(now);
            let delay = backoff * retries;
            node.not_before = chrono::Duration::from_std(delay)
                .ok()
                .filter(|_| !delay.is_zero())
                .map(|d| now + d);
            self.queue.insert(id.clone(), priority);
            warn!(task = %id, attempt = retries, max_retries, error, "task failed, retrying");
            let _ = self.event_tx.send(ColonyEvent::TaskRetrying {
                task_id: id.clone(),
                attempt: retries,
                max_retries,
                error: error.to_string(),
            });
        } else {
            node.fail(error, now);
            error!(task = %id, attempts = retries, error, "task failed permanently");
            let _ = self.event_tx.send(ColonyEvent::TaskFailed {
                task_id: id.clone(),
                error: error.to_string(),
            });
        }

        if let Some(worker) = &worker {
            self.release_worker(worker, id, Some((false, elapsed)), now)?;
        }
        if retries >= max_retries {
            self.block_dependents(id, "upstream failure", now);
        }
        self.process_queue_at(now);
        Ok(())
    }

    /// Fail every unfinished transitive dependent of `id` with `reason`.
    fn block_dependents(&mut self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        for dependent in self.graph.transitive_dependents(id) {
            let Some(node) = self.graph.get_mut(&dependent) else {
                continue;
            };
            if node.is_finished() {
                continue;
            }
            node.fail(reason, now);
            node.last_error = Some(reason.to_string());
            self.queue.remove(&dependent);
            warn!(task = %dependent, upstream = %id, reason, "dependent blocked");
            let _ = self.event_tx.send(ColonyEvent::TaskBlocked {
                task_id: dependent.clone(),
                upstream: id.clone(),
                reason: reason.to_string(),
            });
            blocked.push(dependent);
        }
        blocked
    }

    /// Fail every executing task that has outlived its timeout. The retry
    /// policy applies. Returns the expired ids.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let overdue: Vec<(TaskId, u64)> = self
            .graph
            .nodes()
            .filter(|n| n.is_overdue(now))
            .map(|n| (n.id().clone(), n.epoch))
            .collect();
        let mut expired = Vec::with_capacity(overdue.len());
        for (id, epoch) in overdue {
            warn!(task = %id, "task timed out");
            match self.fail_at(&id, epoch, "timeout", now) {
                Ok(()) => expired.push(id),
                Err(e) => debug!(task = %id, error = %e, "timeout not applied"),
            }
        }
        expired
    }

    // ========== Cancellation ==========

    /// Cancel a task.
    ///
    /// An unassigned task is removed outright and its id retired. An
    /// executing task is flagged and a `CancelRequested` event tells the
    /// runtime to stop it; `acknowledge_cancel` finishes the job.
    ///
    /// # Errors
    /// `InvalidTransition` if an unassigned task still has unfinished
    /// dependents, or if the task already finished.
    pub fn cancel_task(&mut self, id: &TaskId) -> Result<Cancellation> {
        let node = self
            .graph
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

        match &node.status {
            TaskStatus::Waiting | TaskStatus::Queued => {
                if self.graph.has_live_dependents(id) {
                    debug!(task = %id, "cancel refused, dependents have not finished");
                    return Err(Error::InvalidTransition {
                        task: id.clone(),
                        from: node.status.name().to_string(),
                        to: "cancelled".to_string(),
                    });
                }
                self.queue.remove(id);
                self.graph.remove(id);
                self.retired_ids.insert(id.clone());
                info!(task = %id, "task cancelled before assignment");
                let _ = self.event_tx.send(ColonyEvent::TaskCancelled { task_id: id.clone() });
                Ok(Cancellation::Removed)
            }
            TaskStatus::Executing => {
                let epoch = node.epoch;
                let worker = node
                    .assigned_worker
                    .clone()
                    .ok_or_else(|| Error::Validation(format!("task {} has no worker", id)))?;
                if let Some(node) = self.graph.get_mut(id) {
                    node.cancel_requested = true;
                }
                info!(task = %id, worker = %worker, epoch, "cancellation requested");
                let _ = self.event_tx.send(ColonyEvent::CancelRequested {
                    task_id: id.clone(),
                    worker_id: worker.clone(),
                    epoch,
                });
                Ok(Cancellation::Requested { worker, epoch })
            }
            finished => Err(Error::InvalidTransition {
                task: id.clone(),
                from: finished.name().to_string(),
                to: "cancelled".to_string(),
            }),
        }
    }

    /// The runtime stopped a task whose cancellation was requested.
    pub fn acknowledge_cancel(&mut self, id: &TaskId) -> Result<()> {
        let now = Utc::now();
        let node = self
            .graph
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !node.is_executing() || !node.cancel_requested {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: node.status.name().to_string(),
                to: "cancelled".to_string(),
            });
        }
        self.finish_cancel(id, now)
    }

    fn finish_cancel(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<()> {
        let Some(node) = self.graph.get_mut(id) else {
            return Err(Error::TaskNotFound(id.clone()));
        };
        let worker = node.assigned_worker.clone();
        node.cancel(now);
        node.cancel_requested = false;

        if let Some(worker) = &worker {
            self.release_worker(worker, id, None, now)?;
        }
        info!(task = %id, "task cancelled");
        let _ = self.event_tx.send(ColonyEvent::TaskCancelled { task_id: id.clone() });
        self.block_dependents(id, "upstream cancelled", now);
        self.process_queue_at(now);
        Ok(())
    }

    // ========== Analytics ==========

    pub fn distribution_analytics(&self) -> DistributionAnalytics {
        let mut analytics = DistributionAnalytics::default();
        let mut total_duration = Duration::ZERO;

        for node in self.graph.nodes() {
            analytics.total += 1;
            *analytics.by_type.entry(node.task.kind.clone()).or_insert(0) += 1;
            match node.status {
                TaskStatus::Waiting => analytics.waiting += 1,
                TaskStatus::Queued => analytics.queued += 1,
                TaskStatus::Executing => analytics.executing += 1,
                TaskStatus::Completed => {
                    analytics.completed += 1;
                    total_duration += node.duration().unwrap_or_default();
                }
                TaskStatus::Failed { .. } => analytics.failed += 1,
                TaskStatus::Cancelled => analytics.cancelled += 1,
            }
        }

        if analytics.completed > 0 {
            analytics.average_duration_secs =
                total_duration.as_secs_f64() / analytics.completed as f64;
        }
        let finished = analytics.completed + analytics.failed;
        if finished > 0 {
            analytics.success_rate = analytics.completed as f64 / finished as f64;
        }
        analytics.by_worker = self
            .assignments
            .iter()
            .map(|(worker, count)| (worker.to_string(), *count))
            .collect();
        analytics
    }

    // ========== Recovery transitions ==========

    /// Claim a worker for recovery. Returns the task it holds.
    pub fn begin_recovery(&mut self, worker: &WorkerId) -> Result<Option<TaskId>> {
        self.registry.begin_recovery(worker)?;
        Ok(self
            .registry
            .get(worker)
            .and_then(|w| w.current_task.clone()))
    }

    /// Reset a worker under recovery to idle. Its task stays bound to it
    /// until recovery finishes.
    pub fn restart_worker(&mut self, worker: &WorkerId) -> Result<Option<TaskId>> {
        self.registry.restart(worker, Utc::now())
    }

    /// Restart worked. The dropped task, if still bound to the worker, goes
    /// back on the queue without counting as a retry.
    pub fn finish_restored(
        &mut self,
        worker: &WorkerId,
        held: Option<TaskId>,
    ) -> Result<RecoveryOutcome> {
        if !self.registry.contains(worker) {
            return Err(Error::WorkerNotFound(worker.clone()));
        }
        self.registry.end_recovery(worker);
        let requeued = held.filter(|t| self.is_held_by(t, worker));
        if let Some(task) = &requeued {
            self.requeue(task);
        }
        let outcome = RecoveryOutcome::Restored { requeued };
        info!(worker = %worker, "worker restored");
        self.emit_recovery(worker, &outcome);
        self.process_queue();
        Ok(outcome)
    }

    /// Replace a failed worker with a standby of its caste, handing over the
    /// held task under a new epoch.
    ///
    /// # Errors
    /// `RecoveryExhausted` if no standby exists and lazy spawning is off.
    pub fn activate_backup(
        &mut self,
        failed: &WorkerId,
        held: Option<TaskId>,
    ) -> Result<RecoveryOutcome> {
        let now = Utc::now();
        let caste = self
            .registry
            .get(failed)
            .map(|w| w.caste.clone())
            .ok_or_else(|| Error::WorkerNotFound(failed.clone()))?;
        let recovery = self.registry.recovery_config().clone();

        let backup = match self.registry.take_standby(&caste) {
            Some(backup) => backup,
            None if recovery.allow_lazy_backup => self.registry.spawn_standby(&caste)?,
            None => {
                return Err(Error::RecoveryExhausted {
                    worker: failed.clone(),
                    reason: format!("no standby available in {}", caste),
                })
            }
        };

        let transferred = held.filter(|t| self.is_held_by(t, failed));
        self.registry
            .replace_worker(failed, &backup, transferred.clone(), now)?;

        if let Some(task) = &transferred {
            if let Some(node) = self.graph.get_mut(task) {
                let epoch = node.transfer(backup.clone());
                let estimated_completion = node.estimated_completion();
                *self.assignments.entry(backup.clone()).or_insert(0) += 1;
                let agent_type = self
                    .registry
                    .get(&backup)
                    .map(|w| w.agent_type.clone())
                    .unwrap_or_default();
                info!(task = %task, from = %failed, to = %backup, epoch, "task transferred");
                let _ = self.event_tx.send(ColonyEvent::TaskAssigned {
                    task_id: task.clone(),
                    worker_id: backup.clone(),
                    caste: caste.clone(),
                    agent_type,
                    epoch,
                    estimated_completion,
                });
            }
        }

        if recovery.replenish_backups && recovery.is_critical(&caste) {
            self.replenish_standby(&caste);
        }

        let outcome = RecoveryOutcome::Replaced {
            backup,
            transferred,
        };
        self.emit_recovery(failed, &outcome);
        self.process_queue_at(now);
        Ok(outcome)
    }

    /// Give up on a worker: mark it errored and re-queue its task.
    pub fn escalate(
        &mut self,
        worker: &WorkerId,
        held: Option<TaskId>,
        reason: &str,
    ) -> Result<RecoveryOutcome> {
        self.registry.mark_error(worker)?;
        self.registry.end_recovery(worker);
        if let Some(task) = held.filter(|t| self.is_held_by(t, worker)) {
            self.requeue(&task);
        }
        let outcome = RecoveryOutcome::Escalated {
            reason: reason.to_string(),
        };
        error!(worker = %worker, reason, "recovery exhausted");
        self.emit_recovery(worker, &outcome);
        self.process_queue();
        Ok(outcome)
    }

    /// An errored worker answered a later check; return it to service.
    pub fn revive_worker(&mut self, worker: &WorkerId) -> Result<()> {
        self.registry.revive(worker, Utc::now())?;
        self.process_queue();
        Ok(())
    }

    /// An errored worker is still down on a later check; swap it for a
    /// fresh worker. Returns the replacement.
    pub fn replace_errored(&mut self, worker: &WorkerId) -> Result<WorkerId> {
        let fresh = self.registry.replace_errored(worker)?;
        warn!(failed = %worker, replacement = %fresh, "errored worker replaced");
        self.process_queue();
        Ok(fresh)
    }

    /// Release the in-flight claim on a worker whose recovery could not
    /// reach any outcome.
    pub fn abandon_recovery(&mut self, worker: &WorkerId) {
        self.registry.end_recovery(worker);
    }

    /// Drop an unresponsive standby and top the pool back up.
    pub fn discard_standby(&mut self, worker: &WorkerId) -> Result<()> {
        let removed = self.registry.remove_worker(worker)?;
        warn!(worker = %worker, caste = %removed.caste, "standby discarded");
        let recovery = self.registry.recovery_config();
        if recovery.replenish_backups && recovery.is_critical(&removed.caste) {
            self.replenish_standby(&removed.caste);
        }
        Ok(())
    }

    fn replenish_standby(&mut self, caste: &str) {
        let wanted = self.registry.recovery_config().backup_count;
        while self.registry.standby_count(caste) < wanted {
            match self.registry.spawn_standby(caste) {
                Ok(id) => debug!(worker = %id, caste, "standby replenished"),
                Err(e) => {
                    warn!(caste, error = %e, "standby replenish failed");
                    break;
                }
            }
        }
    }

    // ========== Scaling ==========

    /// Carry out a scaling decision. The registry re-checks the bounds.
    pub fn apply_scaling(&mut self, decision: &ScalingDecision) -> Result<ScaleResult> {
        if decision.action == ScalingAction::None {
            return Ok(ScaleResult::default());
        }
        let result = self
            .registry
            .scale_to(&decision.caste, decision.target_count)?;
        info!(
            caste = %decision.caste,
            action = %decision.action,
            target = decision.target_count,
            spawned = result.spawned.len(),
            removed = result.removed.len(),
            "scaling applied"
        );
        if !result.spawned.is_empty() {
            self.process_queue();
        }
        Ok(result)
    }

    // ========== Helpers ==========

    fn current_epoch(&self, id: &TaskId) -> Result<u64> {
        self.graph
            .get(id)
            .map(|n| n.epoch)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Reject reports for tasks that are not executing or carry an old epoch.
    fn check_report(&self, id: &TaskId, epoch: u64, to: &str) -> Result<()> {
        let node = self
            .graph
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !node.is_executing() {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: node.status.name().to_string(),
                to: to.to_string(),
            });
        }
        if epoch != node.epoch {
            warn!(task = %id, reported = epoch, current = node.epoch, "stale report discarded");
            let _ = self.event_tx.send(ColonyEvent::StaleReportDiscarded {
                task_id: id.clone(),
                reported: epoch,
                current: node.epoch,
            });
            return Err(Error::StaleAssignment {
                task: id.clone(),
                reported: epoch,
                current: node.epoch,
            });
        }
        Ok(())
    }

    /// Release a worker from `task`. `outcome` carries the performance
    /// sample; `None` releases without one. A worker already moved on to a
    /// different task is left alone.
    fn release_worker(
        &mut self,
        worker: &WorkerId,
        task: &TaskId,
        outcome: Option<(bool, Duration)>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(current) = self.registry.get(worker) else {
            return Ok(());
        };
        if current.current_task.as_ref().is_some_and(|t| t != task) {
            debug!(worker = %worker, task = %task, "worker already reassigned");
            return Ok(());
        }
        match outcome {
            Some((success, duration)) => self.registry.release(worker, success, duration, now),
            None => self.registry.release_untracked(worker, now),
        }
    }

    fn is_held_by(&self, task: &TaskId, worker: &WorkerId) -> bool {
        self.graph
            .get(task)
            .map(|n| n.is_executing() && n.assigned_worker.as_ref() == Some(worker))
            .unwrap_or(false)
    }

    fn requeue(&mut self, task: &TaskId) {
        if let Some(node) = self.graph.get_mut(task) {
            node.enqueue(Utc::now());
            let priority = node.task.priority;
            self.queue.insert(task.clone(), priority);
            debug!(task = %task, "task re-queued");
        }
    }

    fn emit_recovery(&self, worker: &WorkerId, outcome: &RecoveryOutcome) {
        let _ = self.event_tx.send(ColonyEvent::RecoveryFinished {
            worker_id: worker.clone(),
            outcome: outcome.clone(),
        });
    }
}

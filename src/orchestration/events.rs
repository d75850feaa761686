//! Events emitted to external observers.
//!
//! Every component publishes on the same unbounded channel so observers
//! see one ordered stream of state changes.

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;
use crate::orchestration::health::HealthIssue;
use crate::orchestration::scaling::ScalingDecision;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<ColonyEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ColonyEvent>;

/// Create the colony event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// How a recovery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RecoveryOutcome {
    /// Restart plus reverification brought the worker back.
    Restored {
        /// Task that was re-queued because the restart dropped it.
        requeued: Option<TaskId>,
    },
    /// A standby took over and the failed worker was retired.
    Replaced {
        backup: WorkerId,
        transferred: Option<TaskId>,
    },
    /// Neither restart nor backup activation succeeded.
    Escalated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ColonyEvent {
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
        caste: String,
        agent_type: String,
        epoch: u64,
        estimated_completion: Option<DateTime<Utc>>,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        max_retries: u32,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    /// A dependent was failed because something upstream failed or was cancelled.
    TaskBlocked {
        task_id: TaskId,
        upstream: TaskId,
        reason: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    /// The runtime must stop the worker and acknowledge.
    CancelRequested {
        task_id: TaskId,
        worker_id: WorkerId,
        epoch: u64,
    },
    StaleReportDiscarded {
        task_id: TaskId,
        reported: u64,
        current: u64,
    },
    WorkerSpawned {
        worker_id: WorkerId,
        caste: String,
        standby: bool,
    },
    WorkerRemoved {
        worker_id: WorkerId,
        caste: String,
    },
    HealthAlert {
        worker_id: WorkerId,
        issues: Vec<HealthIssue>,
    },
    RecoveryFinished {
        worker_id: WorkerId,
        outcome: RecoveryOutcome,
    },
    CasteEscalated {
        caste: String,
        failures: usize,
    },
    ScalingRecommended {
        decision: ScalingDecision,
    },
}

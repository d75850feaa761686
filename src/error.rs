use thiserror::Error;

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Unknown caste: {0}")]
    UnknownCaste(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Worker is busy: {0}")]
    WorkerBusy(WorkerId),

    #[error("Caste {caste} must stay within [{min}, {max}] workers (attempted {attempted})")]
    CapacityBoundViolation {
        caste: String,
        attempted: usize,
        min: usize,
        max: usize,
    },

    #[error("Stale report for task {task}: epoch {reported} (current {current})")]
    StaleAssignment {
        task: TaskId,
        reported: u64,
        current: u64,
    },

    #[error("Recovery already in flight for worker {0}")]
    RecoveryInFlight(WorkerId),

    #[error("Recovery exhausted for worker {worker}: {reason}")]
    RecoveryExhausted { worker: WorkerId, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Coordinator channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

//! Core domain models for the colony scheduler.
//!
//! Tasks, workers, castes and the dependency graph. Nothing here knows
//! about channels, locks or time-driven loops.

pub mod caste;
pub mod dag;
pub mod task;
pub mod worker;

pub use caste::CasteConfig;
pub use dag::TaskGraph;
pub use task::{Priority, Task, TaskId, TaskNode, TaskStatus, TaskSubmission};
pub use worker::{Performance, Worker, WorkerId, WorkerStatus};

//! Orchestration layer for the colony.
//!
//! The `Scheduler` owns all mutable task and worker state. The
//! `HealthMonitor` and `ScalingController` read snapshots of it and submit
//! changes back through its methods. The `Coordinator` runs all of them on
//! one serialized event loop and hands out a `ColonyHandle`.

mod coordinator;
mod events;
mod health;
mod queue;
mod registry;
mod router;
mod scaling;
mod scheduler;

pub use coordinator::{ColonyHandle, Coordinator};
pub use events::{channel, ColonyEvent, EventReceiver, EventSender, RecoveryOutcome};
pub use health::{
    EscalationTracker, HealthIssue, HealthMonitor, HealthRecord, LoopbackProbe, TickReport,
    WorkerProbe,
};
pub use queue::{QueueEntry, ReadyQueue};
pub use registry::{CasteCount, CasteSummary, RegistrySummary, ScaleResult, WorkerRegistry};
pub use router::{CasteRouter, DEFAULT_CASTE};
pub use scaling::{
    MetricsSnapshot, MetricsSource, ScalingAction, ScalingController, ScalingDecision,
    SchedulerMetrics, StaticMetrics,
};
pub use scheduler::{Cancellation, DistributionAnalytics, Scheduler};

//! Worker data model.
//!
//! A worker is an executor slot owned by exactly one caste. The registry
//! creates and mutates workers; everything else reads snapshots.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable handle for a worker, formatted `"{caste}-{seq}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    /// Pre-provisioned backup; not assignable until activated.
    Standby,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Standby => "standby",
            WorkerStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Rolling performance statistics for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Moving average over completed tasks.
    pub average_task_time: Duration,
    /// Cumulative average of 1/0 outcome indicators.
    pub success_rate: f64,
    pub last_active: DateTime<Utc>,
}

impl Performance {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            average_task_time: Duration::ZERO,
            success_rate: 1.0,
            last_active: now,
        }
    }

    /// Fold one finished task into the statistics.
    ///
    /// `duration` only feeds the average when the task succeeded.
    pub fn record(&mut self, success: bool, duration: Duration, now: DateTime<Utc>) {
        if success {
            self.tasks_completed += 1;
            let n = self.tasks_completed as f64;
            let avg = self.average_task_time.as_secs_f64();
            let next = avg + (duration.as_secs_f64() - avg) / n;
            self.average_task_time = Duration::from_secs_f64(next.max(0.0));
        } else {
            self.tasks_failed += 1;
        }

        let attempts = (self.tasks_completed + self.tasks_failed) as f64;
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate += (sample - self.success_rate) / attempts;
        self.last_active = now;
    }
}

/// A worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub caste: String,
    pub agent_type: String,
    pub specialization: String,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub performance: Performance,
    /// Global spawn order, used as a stable tie-breaker.
    pub registration: u64,
}

impl Worker {
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn is_standby(&self) -> bool {
        self.status == WorkerStatus::Standby
    }

    /// Counted against the caste's `[min, max]` bounds.
    pub fn is_active(&self) -> bool {
        self.status != WorkerStatus::Standby
    }

    /// Time since the worker last reported activity.
    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        (now - self.performance.last_active)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

//! Task data model for the dependency graph.
//!
//! Tasks are the units of work the scheduler hands to workers. A
//! [`TaskSubmission`] is what callers send; it is validated into a [`Task`]
//! with defaults applied, and wrapped in a [`TaskNode`] that carries the
//! scheduling state derived from the graph.

use crate::config::SchedulerConfig;
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Callers may choose their own ids; when they don't, a UUID v4 is
/// generated. Ids are never reused within a scheduler's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task priority. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Submitted, at least one dependency not yet completed.
    #[default]
    Waiting,
    /// Dependencies satisfied, sitting in the ready queue.
    Queued,
    /// Assigned to a worker.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, or blocked by an upstream failure.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Cancelled while executing, after the worker acknowledged.
    Cancelled,
}

impl TaskStatus {
    /// Short name without the failure reason.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Queued => "queued",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A raw task as submitted by a caller.
///
/// Only `type` is required. Unknown fields are rejected so typos surface
/// as validation errors instead of silently applied defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSubmission {
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskSubmission {
    /// Create a submission with only a type set.
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(TaskId::from(id));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dependencies(mut self, deps: &[&TaskId]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).clone()).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A validated task with defaults applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: Priority,
    pub description: String,
    pub requirements: Vec<String>,
    pub dependencies: Vec<TaskId>,
    pub estimated_duration: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Validate a submission and fill in defaults from the scheduler config.
    ///
    /// Duplicate dependency entries are collapsed, keeping first occurrence.
    pub fn from_submission(submission: TaskSubmission, defaults: &SchedulerConfig) -> Result<Self> {
        let kind = submission.kind.trim().to_string();
        if kind.is_empty() {
            return Err(Error::Validation("task type must not be empty".to_string()));
        }

        let id = submission.id.unwrap_or_default();
        if id.0.trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }

        let mut dependencies: Vec<TaskId> = Vec::with_capacity(submission.dependencies.len());
        for dep in submission.dependencies {
            if dep == id {
                return Err(Error::Validation(format!("task {} depends on itself", id)));
            }
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let timeout = submission
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| defaults.default_timeout());
        if timeout.is_zero() {
            return Err(Error::Validation(format!("task {} has a zero timeout", id)));
        }

        Ok(Self {
            id,
            kind,
            priority: submission.priority.unwrap_or(defaults.default_priority),
            description: submission.description.unwrap_or_default(),
            requirements: submission.requirements,
            dependencies,
            estimated_duration: submission
                .estimated_duration_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| defaults.default_estimated_duration()),
            max_retries: submission.max_retries.unwrap_or(defaults.default_max_retries),
            timeout,
            metadata: submission.metadata,
            created_at: Utc::now(),
        })
    }
}

/// A task plus the scheduling state the graph tracks for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub task: Task,
    pub status: TaskStatus,
    pub assigned_worker: Option<WorkerId>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Failures recorded so far.
    pub retries: u32,
    /// Incremented on every assignment; reports carrying an older epoch are stale.
    pub epoch: u64,
    pub last_error: Option<String>,
    /// Retry backoff gate: the task may not be assigned before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// When the task last entered the ready queue.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    /// Time spent ready but unassigned before the latest assignment.
    #[serde(default)]
    pub queue_wait: Option<Duration>,
}

impl TaskNode {
    /// Wrap a task in a fresh node with `Waiting` status.
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Waiting,
            assigned_worker: None,
            start_time: None,
            completion_time: None,
            result: None,
            retries: 0,
            epoch: 0,
            last_error: None,
            not_before: None,
            cancel_requested: false,
            queued_at: None,
            queue_wait: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    /// Move to `Queued`, clearing any previous assignment.
    pub fn enqueue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.assigned_worker = None;
        self.start_time = None;
        self.queued_at = Some(now);
    }

    /// How long the task has been assignable. A retry backoff gate counts
    /// as not ready yet.
    pub fn ready_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let since = match (self.queued_at, self.not_before) {
            (Some(queued), Some(gate)) => queued.max(gate),
            (Some(queued), None) => queued,
            (None, _) => return None,
        };
        Some((now - since).to_std().unwrap_or_default())
    }

    /// Move to `Waiting`.
    pub fn wait(&mut self) {
        self.status = TaskStatus::Waiting;
        self.assigned_worker = None;
    }

    /// Bind the task to a worker. Returns the new assignment epoch.
    pub fn start(&mut self, worker: WorkerId, now: DateTime<Utc>) -> u64 {
        self.queue_wait = self.ready_wait(now);
        self.queued_at = None;
        self.status = TaskStatus::Executing;
        self.assigned_worker = Some(worker);
        self.start_time = Some(now);
        self.not_before = None;
        self.epoch += 1;
        self.epoch
    }

    /// Rebind an executing task to another worker without restarting its clock.
    pub fn transfer(&mut self, worker: WorkerId) -> u64 {
        self.assigned_worker = Some(worker);
        self.epoch += 1;
        self.epoch
    }

    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.completion_time = Some(now);
        self.result = Some(result);
    }

    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        self.completion_time = Some(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completion_time = Some(now);
    }

    pub fn is_executing(&self) -> bool {
        self.status == TaskStatus::Executing
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Completed, failed or cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Wall time from assignment to completion.
    pub fn duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.completion_time?;
        (end - start).to_std().ok()
    }

    /// Whether the task has outlived its timeout at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.is_executing(), self.start_time) {
            (true, Some(start)) => (now - start)
                .to_std()
                .map(|elapsed| elapsed > self.task.timeout)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Expected completion instant for the current assignment.
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        let start = self.start_time?;
        let estimate = chrono::Duration::from_std(self.task.estimated_duration).ok()?;
        Some(start + estimate)
    }
}

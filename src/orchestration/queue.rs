//! Priority-ordered ready queue.
//!
//! A new entry goes in front of the first entry with strictly lower
//! priority, so equal priorities keep arrival order.

use crate::core::task::{Priority, TaskId};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: Priority,
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: VecDeque<QueueEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. Returns the position it landed at.
    pub fn insert(&mut self, task_id: TaskId, priority: Priority) -> usize {
        let pos = self
            .entries
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, QueueEntry { task_id, priority });
        pos
    }

    pub fn remove(&mut self, task_id: &TaskId) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| &e.task_id == task_id)?;
        self.entries.remove(pos)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.iter().any(|e| &e.task_id == task_id)
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Task ids in dequeue order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|e| e.task_id.clone()).collect()
    }
}

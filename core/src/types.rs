//! Core identifier and state types for the Gantry engine.
//!
//! This module defines the identifiers, lifecycle states, and per-task
//! options used across the blob store, task graph, and scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(Uuid);

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

impl_id!(BlobId);
impl_id!(TaskId);
impl_id!(SessionId);

/// Named routing domain that constrains which worker slots may execute a task.
pub type PartitionId = String;

/// Lifecycle state of a blob.
///
/// Transitions are `Created -> Completed` (inline data),
/// `Created -> Pending -> Completed` (produced output), or
/// `Created -> Pending -> Error`. A blob leaves Pending exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobState {
    Created,
    Pending,
    Completed,
    Error,
}

impl BlobState {
    /// Whether the blob can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Submitted, waiting for one or more input blobs.
    Submitted,
    /// All inputs resolved, queued for dispatch.
    Ready,
    /// Assigned to a worker slot.
    Dispatched,
    /// Worker body executing.
    Running,
    /// Terminal success, outputs completed.
    Succeeded,
    /// Terminal failure, outputs failed.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Per-task execution options.
///
/// A session carries a default set; a task definition may override it
/// wholesale. A missing partition falls back to the session's default
/// partition at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Maximum number of times a task is redispatched after a transient failure.
    pub max_retries: u32,
    /// Hard wall-clock bound on a single execution attempt.
    pub max_duration: Duration,
    /// Dispatch priority; higher values dispatch first within a partition.
    pub priority: i32,
    /// Target partition; `None` defers to the session default.
    pub partition: Option<PartitionId>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_duration: Duration::from_secs(60),
            priority: 0,
            partition: None,
        }
    }
}

impl TaskOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<PartitionId>) -> Self {
        self.partition = Some(partition.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(BlobId::new(), BlobId::new());
        assert_ne!(TaskId::new(), TaskId::new());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_blob_state_terminality() {
        assert!(BlobState::Completed.is_terminal());
        assert!(BlobState::Error.is_terminal());
        assert!(!BlobState::Created.is_terminal());
        assert!(!BlobState::Pending.is_terminal());
    }

    #[test]
    fn test_task_state_terminality() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        for state in [
            TaskState::Submitted,
            TaskState::Ready,
            TaskState::Dispatched,
            TaskState::Running,
        ] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn test_default_options() {
        let options = TaskOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.priority, 0);
        assert!(options.partition.is_none());

        let options = TaskOptions::default()
            .with_max_retries(1)
            .with_priority(5)
            .with_partition("sum");
        assert_eq!(options.max_retries, 1);
        assert_eq!(options.priority, 5);
        assert_eq!(options.partition.as_deref(), Some("sum"));
    }
}

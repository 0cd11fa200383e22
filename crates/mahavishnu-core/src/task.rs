//! Task entities
//!
//! A task is the unit of submission. Its state machine only moves forward;
//! a task may be retried into a fresh workflow while the original record is
//! preserved, so tasks and workflows have separate identities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{TaskId, WorkflowId};

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether a transition to `next` moves the state machine forward
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Queued => next != Self::Queued,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A submitted task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, time-ordered id
    pub id: TaskId,

    /// Task type, resolved to adapter preferences by the registry
    pub task_type: String,

    /// Opaque parameters, validated at the adapter boundary
    pub params: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,

    /// Absolute deadline; retries never run past it
    pub deadline: DateTime<Utc>,

    #[serde(default)]
    pub priority: Priority,

    /// Optional idempotency key; identical re-submissions within the
    /// idempotency window return the original workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub status: TaskStatus,

    /// Weak reference to the workflow executing this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<WorkflowId>,
}

impl Task {
    /// Create a queued task, validating the deadline
    pub fn new(
        id: TaskId,
        task_type: impl Into<String>,
        params: BTreeMap<String, serde_json::Value>,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Self> {
        if deadline <= created_at {
            return Err(Error::invalid("task deadline must be after creation time")
                .with_context("created_at", created_at)
                .with_context("deadline", deadline));
        }
        Ok(Self {
            id,
            task_type: task_type.into(),
            params,
            created_at,
            deadline,
            priority: Priority::Normal,
            idempotency_key: None,
            status: TaskStatus::Queued,
            workflow_ref: None,
        })
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Advance the status, rejecting backward transitions
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::conflict("task state may only move forward")
                .with_context("task_id", self.id)
                .with_context("from", self.status)
                .with_context("to", next));
        }
        self.status = next;
        Ok(())
    }

    /// Time remaining until the deadline, zero if already past
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.deadline
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;
    use chrono::Duration as ChronoDuration;

    fn task() -> Task {
        let ids = IdGenerator::new();
        let now = Utc::now();
        Task::new(
            TaskId::generate(&ids),
            "echo",
            BTreeMap::new(),
            now,
            now + ChronoDuration::seconds(60),
        )
        .unwrap()
    }

    #[test]
    fn test_deadline_must_follow_creation() {
        let ids = IdGenerator::new();
        let now = Utc::now();
        let result = Task::new(TaskId::generate(&ids), "echo", BTreeMap::new(), now, now);
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_transitions() {
        let mut t = task();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Succeeded).unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut t = task();
        t.transition(TaskStatus::Running).unwrap();
        let err = t.transition(TaskStatus::Queued).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        assert!(t.transition(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_remaining_clamps_to_zero() {
        let t = task();
        let later = t.deadline + ChronoDuration::seconds(5);
        assert_eq!(t.remaining(later), std::time::Duration::ZERO);
    }
}

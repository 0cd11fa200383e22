//! Workflow lifecycle events
//!
//! Observable at the edges of each transition, exactly once per transition.
//! The bus is a thin wrapper over a broadcast channel; slow subscribers that
//! lag are skipped rather than blocking emission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::id::{CorrelationId, WorkflowId};

/// A workflow lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
    },
    WorkflowStepCompleted {
        workflow_id: WorkflowId,
        step: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        error: String,
    },
    WorkflowCancelled {
        workflow_id: WorkflowId,
    },
}

impl LifecycleEvent {
    /// Workflow this event belongs to
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            Self::WorkflowStarted { workflow_id }
            | Self::WorkflowStepCompleted { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id } => *workflow_id,
        }
    }

    /// Event name as recorded in the audit stream
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::WorkflowStepCompleted { .. } => "workflow.step_completed",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
        }
    }

    /// Whether this event closes the workflow's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}

/// An emitted event with its envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: LifecycleEvent,
    pub correlation_id: CorrelationId,
    pub emitted_at: DateTime<Utc>,
}

/// Broadcast bus for lifecycle events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus with the given subscriber buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all current subscribers
    ///
    /// Emission never fails; an event with no subscribers is dropped.
    pub fn emit(&self, event: LifecycleEvent, correlation_id: CorrelationId) -> EventEnvelope {
        let envelope = EventEnvelope {
            event,
            correlation_id,
            emitted_at: Utc::now(),
        };
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let ids = IdGenerator::new();
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let workflow_id = WorkflowId::generate(&ids);
        bus.emit(
            LifecycleEvent::WorkflowStarted { workflow_id },
            CorrelationId::generate(&ids),
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.workflow_id(), workflow_id);
        assert_eq!(envelope.event.name(), "workflow.started");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let ids = IdGenerator::new();
        let bus = EventBus::new(16);
        bus.emit(
            LifecycleEvent::WorkflowCompleted {
                workflow_id: WorkflowId::generate(&ids),
            },
            CorrelationId::generate(&ids),
        );
    }

    #[test]
    fn test_terminal_classification() {
        let ids = IdGenerator::new();
        let id = WorkflowId::generate(&ids);
        assert!(!LifecycleEvent::WorkflowStarted { workflow_id: id }.is_terminal());
        assert!(LifecycleEvent::WorkflowCancelled { workflow_id: id }.is_terminal());
    }
}

//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mahavishnu_core::{CorrelationId, TaskId, WorkflowId};
use mahavishnu_core::Result;

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Record persisted, execution not yet started
    Created,

    /// Steps are executing
    Running,

    /// All steps committed
    Succeeded,

    /// A step failed terminally
    Failed,

    /// Cancelled by an external request
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Status is monotonic: forward transitions only
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        match self {
            Self::Created => matches!(
                next,
                Self::Running | Self::Succeeded | Self::Failed | Self::Cancelled
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Persisted workflow record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,

    /// Weak reference to the submitting task
    pub task_ref: TaskId,

    pub task_type: String,

    /// Submitted task parameters, needed to resume after a restart
    pub params: serde_json::Value,

    /// Adapter the workflow was routed to, once known
    pub adapter: Option<String>,

    pub status: WorkflowStatus,

    /// Name of the most recently started step
    pub current_step: Option<String>,

    pub steps_total: u32,
    pub steps_completed: u32,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing workflows
#[derive(Debug, Clone)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub adapter: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for WorkflowFilter {
    fn default() -> Self {
        Self {
            status: None,
            adapter: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Idempotency index entry
///
/// Submissions carrying the same key and fingerprint inside the window map
/// to the original workflow; a matching key with a different fingerprint is
/// a `Conflict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,

    /// Canonical serialization of the submitted params
    pub params_fingerprint: String,

    pub workflow_id: WorkflowId,

    pub expires_at: DateTime<Utc>,
}

/// Append-only audit entry for one state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub workflow_id: WorkflowId,
    pub correlation_id: CorrelationId,

    /// Transition name, e.g. `workflow.step_completed`
    pub name: String,

    pub detail: serde_json::Value,

    pub recorded_at: DateTime<Utc>,
}

/// Store for workflow records, idempotency index and audit stream
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Persist a new workflow record
    async fn create(&self, record: WorkflowRecord) -> Result<()>;

    /// Fetch a record; `NotFound` when unknown
    async fn get(&self, id: WorkflowId) -> Result<WorkflowRecord>;

    /// Advance the status (forward-only; backward transitions are `Conflict`)
    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Record step progress
    async fn update_progress(
        &self,
        id: WorkflowId,
        current_step: &str,
        steps_completed: u32,
        adapter: Option<String>,
    ) -> Result<()>;

    /// List records matching the filter, newest first
    async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowRecord>>;

    /// Number of workflows that have been `Running` longer than `age`
    async fn count_running_older_than(&self, age: Duration) -> Result<usize>;

    /// Insert an idempotency mapping
    async fn put_idempotency(&self, record: IdempotencyRecord) -> Result<()>;

    /// Look up a live idempotency mapping (expired entries are not returned)
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Append an audit event
    async fn append_audit(&self, event: AuditEvent) -> Result<()>;

    /// Audit events of one workflow in append order
    async fn list_audit(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEvent>>;
}

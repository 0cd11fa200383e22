//! CheckpointStore trait definition
//!
//! Checkpoints are versioned snapshots written after each committed step.
//! Writes are all-or-nothing; reads always return the highest version.
//! Concurrent writers resolve by version precedence: a writer holding a
//! stale version fails with `Conflict` and must re-read before retrying.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mahavishnu_core::{Error, Result, WorkflowId};

/// A committed checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub workflow_id: WorkflowId,

    /// Name of the step whose completion this checkpoint records
    pub step: String,

    /// Opaque state blob
    pub state: serde_json::Value,

    /// Monotonic per-workflow version, starting at 1
    pub version: u64,

    pub created_at: DateTime<Utc>,
}

/// Filter for listing checkpoints
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub workflow_id: Option<WorkflowId>,
    /// Maximum entries returned; 0 means no limit
    pub limit: usize,
}

impl CheckpointFilter {
    /// All checkpoints of one workflow
    pub fn for_workflow(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            limit: 0,
        }
    }
}

/// Store for workflow checkpoints
///
/// Implementations must be thread-safe, write atomically and never expose a
/// partially written blob to readers.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Write a checkpoint
    ///
    /// `expected_version` is the version of the latest checkpoint the writer
    /// has observed (0 when none). A mismatch fails with `Conflict`; blobs
    /// above the store's size cap fail with `Invalid`. Returns the new
    /// version.
    async fn put(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64>;

    /// Highest-version checkpoint of a workflow, if any
    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>>;

    /// Delete every checkpoint of a workflow (workflow succeeded, or GC)
    async fn delete(&self, workflow_id: WorkflowId) -> Result<()>;

    /// List checkpoints, newest version first per workflow
    async fn list(&self, filter: CheckpointFilter) -> Result<Vec<Checkpoint>>;

    /// Keep the workflow's checkpoints until `until` (failed/cancelled TTL)
    async fn retain_until(&self, workflow_id: WorkflowId, until: DateTime<Utc>) -> Result<()>;

    /// Drop checkpoints whose retention expired; returns how many workflows
    /// were collected
    async fn gc_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Verify the store can accept writes (readiness probe)
    async fn probe_writable(&self) -> Result<()>;
}

/// Shared size-cap enforcement
pub(crate) fn enforce_size_cap(
    workflow_id: WorkflowId,
    state: &serde_json::Value,
    max_size_bytes: usize,
) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(state)?;
    if encoded.len() > max_size_bytes {
        return Err(Error::invalid("checkpoint blob exceeds size cap")
            .with_context("workflow_id", workflow_id)
            .with_context("size_bytes", encoded.len())
            .with_context("cap_bytes", max_size_bytes));
    }
    Ok(encoded)
}

//! In-memory store implementations for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use mahavishnu_core::{Error, Result, WorkflowId};

use super::checkpoint::{enforce_size_cap, Checkpoint, CheckpointFilter, CheckpointStore};
use super::workflow_store::{
    AuditEvent, IdempotencyRecord, WorkflowFilter, WorkflowRecord, WorkflowStore,
};

/// Per-workflow checkpoint chain
#[derive(Default)]
struct CheckpointChain {
    checkpoints: Vec<Checkpoint>,
    retained_until: Option<DateTime<Utc>>,
}

/// In-memory implementation of [`CheckpointStore`]
///
/// Provides the same semantics as the durable implementations and is
/// primarily for tests.
pub struct InMemoryCheckpointStore {
    chains: RwLock<HashMap<WorkflowId, CheckpointChain>>,
    max_size_bytes: usize,
}

impl InMemoryCheckpointStore {
    /// Create a store with the default 4 MiB size cap
    pub fn new() -> Self {
        Self::with_max_size(4 * 1024 * 1024)
    }

    /// Create a store with a custom size cap
    pub fn with_max_size(max_size_bytes: usize) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            max_size_bytes,
        }
    }

    /// Number of workflows holding checkpoints
    pub fn workflow_count(&self) -> usize {
        self.chains.read().len()
    }

    /// Total checkpoint count across all workflows
    pub fn checkpoint_count(&self) -> usize {
        self.chains
            .read()
            .values()
            .map(|c| c.checkpoints.len())
            .sum()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64> {
        enforce_size_cap(workflow_id, state, self.max_size_bytes)?;

        let mut chains = self.chains.write();
        let chain = chains.entry(workflow_id).or_default();
        let latest = chain.checkpoints.last().map(|c| c.version).unwrap_or(0);

        if latest != expected_version {
            return Err(Error::conflict("checkpoint version is stale")
                .with_context("workflow_id", workflow_id)
                .with_context("expected", expected_version)
                .with_context("latest", latest));
        }

        let version = latest + 1;
        chain.checkpoints.push(Checkpoint {
            workflow_id,
            step: step.to_string(),
            state: state.clone(),
            version,
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>> {
        Ok(self
            .chains
            .read()
            .get(&workflow_id)
            .and_then(|c| c.checkpoints.last().cloned()))
    }

    async fn delete(&self, workflow_id: WorkflowId) -> Result<()> {
        self.chains.write().remove(&workflow_id);
        Ok(())
    }

    async fn list(&self, filter: CheckpointFilter) -> Result<Vec<Checkpoint>> {
        let chains = self.chains.read();
        let mut out: Vec<Checkpoint> = match filter.workflow_id {
            Some(id) => chains
                .get(&id)
                .map(|c| c.checkpoints.clone())
                .unwrap_or_default(),
            None => chains
                .values()
                .flat_map(|c| c.checkpoints.iter().cloned())
                .collect(),
        };
        out.sort_by(|a, b| (b.workflow_id, b.version).cmp(&(a.workflow_id, a.version)));
        if filter.limit > 0 {
            out.truncate(filter.limit);
        }
        Ok(out)
    }

    async fn retain_until(&self, workflow_id: WorkflowId, until: DateTime<Utc>) -> Result<()> {
        let mut chains = self.chains.write();
        if let Some(chain) = chains.get_mut(&workflow_id) {
            chain.retained_until = Some(until);
        }
        Ok(())
    }

    async fn gc_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut chains = self.chains.write();
        let before = chains.len();
        chains.retain(|_, chain| match chain.retained_until {
            Some(until) => until > now,
            None => true,
        });
        Ok((before - chains.len()) as u64)
    }

    async fn probe_writable(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory implementation of [`WorkflowStore`]
pub struct InMemoryWorkflowStore {
    records: RwLock<HashMap<WorkflowId, WorkflowRecord>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    audit: RwLock<Vec<AuditEvent>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            audit: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored workflow records
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, record: WorkflowRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(Error::conflict("workflow record already exists")
                .with_context("workflow_id", record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: WorkflowId) -> Result<WorkflowRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("unknown workflow").with_context("workflow_id", id))
    }

    async fn update_status(
        &self,
        id: WorkflowId,
        status: super::WorkflowStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("unknown workflow").with_context("workflow_id", id))?;

        if !record.status.can_transition_to(status) {
            return Err(Error::conflict("workflow status may only move forward")
                .with_context("workflow_id", id)
                .with_context("from", record.status)
                .with_context("to", status));
        }

        record.status = status;
        record.last_error = last_error;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_progress(
        &self,
        id: WorkflowId,
        current_step: &str,
        steps_completed: u32,
        adapter: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("unknown workflow").with_context("workflow_id", id))?;
        record.current_step = Some(current_step.to_string());
        record.steps_completed = steps_completed;
        if adapter.is_some() {
            record.adapter = adapter;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowRecord>> {
        let records = self.records.read();
        let mut out: Vec<WorkflowRecord> = records
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                filter
                    .adapter
                    .as_ref()
                    .map_or(true, |a| r.adapter.as_deref() == Some(a.as_str()))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn count_running_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.status == super::WorkflowStatus::Running && r.created_at < cutoff)
            .count())
    }

    async fn put_idempotency(&self, record: IdempotencyRecord) -> Result<()> {
        self.idempotency.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .idempotency
            .read()
            .get(key)
            .filter(|r| r.expires_at > Utc::now())
            .cloned())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        self.audit.write().push(event);
        Ok(())
    }

    async fn list_audit(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEvent>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

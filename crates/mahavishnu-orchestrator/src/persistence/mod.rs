//! Durable state
//!
//! Two store seams back the engine: [`CheckpointStore`] holds the versioned,
//! atomically-written step snapshots that make workflows resumable, and
//! [`WorkflowStore`] holds workflow records, the idempotency index and the
//! append-only audit stream.
//!
//! Implementations: in-memory (tests), filesystem (checkpoints, single-node
//! durability via write-temp-then-rename), PostgreSQL (both stores).

mod checkpoint;
mod fs;
mod memory;
mod postgres;
mod workflow_store;

pub use checkpoint::{Checkpoint, CheckpointFilter, CheckpointStore};
pub use fs::FsCheckpointStore;
pub use memory::{InMemoryCheckpointStore, InMemoryWorkflowStore};
pub use postgres::{PostgresCheckpointStore, PostgresWorkflowStore};
pub use workflow_store::{
    AuditEvent, IdempotencyRecord, WorkflowFilter, WorkflowRecord, WorkflowStatus, WorkflowStore,
};

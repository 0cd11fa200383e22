//! Execution engine adapters
//!
//! An adapter is the uniform facade the core uses to talk to any execution
//! engine: `{initialize, health, execute, cancel, shutdown}`. The core
//! recognises three variants - `local` spawns in-process workers,
//! `delegated` forwards to another server's task surface and `remote`
//! submits to an orchestrator cluster. Which engine actually runs behind a
//! name is opaque to everything above this seam.

mod delegated;
mod local;
mod registry;
mod remote;

pub use delegated::{DelegatedAdapter, HttpTaskSurfaceClient, TaskSurfaceClient};
pub use local::{LocalAdapter, StepHandler};
pub use registry::{AdapterRegistry, AdapterSummary, RegisteredAdapter};
pub use remote::{ClusterClient, HttpClusterClient, RemoteAdapter, RemoteTaskStatus};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mahavishnu_core::{CorrelationId, Result, WorkflowId};

/// Adapter variants recognised by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterVariant {
    /// In-process or child-process workers
    Local,
    /// Forwards to another server's task surface
    Delegated,
    /// Submits to an orchestrator cluster
    Remote,
}

impl std::fmt::Display for AdapterVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Delegated => write!(f, "delegated"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Adapter health as reported by its own check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdapterHealth {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl AdapterHealth {
    /// Whether the adapter can take calls at all
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unhealthy { .. })
    }
}

/// One step execution request handed to an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub workflow_id: WorkflowId,

    /// Step name within the workflow
    pub step: String,

    /// Handler key the adapter dispatches on
    pub operation: String,

    /// Opaque input payload
    pub payload: serde_json::Value,

    /// Per-call deadline enforced by the worker envelope
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub correlation_id: CorrelationId,
}

/// Progress emitted by a streaming execution
#[derive(Debug)]
pub enum StepProgress {
    /// Intermediate progress payload
    Update(serde_json::Value),

    /// Final outcome; the stream ends after this item
    Done(Result<serde_json::Value>),
}

/// Stream of progress updates terminated by a `Done` item
pub type ProgressStream = Pin<Box<dyn Stream<Item = StepProgress> + Send>>;

/// Outcome of an adapter execution
pub enum StepOutcome {
    /// The step completed with a final value
    Completed(serde_json::Value),

    /// The step streams progress before resolving
    Streaming(ProgressStream),
}

impl StepOutcome {
    /// Drain to the final value, discarding intermediate progress
    pub async fn into_result(self) -> Result<serde_json::Value> {
        use futures::StreamExt;

        match self {
            Self::Completed(value) => Ok(value),
            Self::Streaming(mut stream) => {
                let mut last = None;
                while let Some(item) = stream.next().await {
                    if let StepProgress::Done(result) = item {
                        last = Some(result);
                        break;
                    }
                }
                last.unwrap_or_else(|| {
                    Err(mahavishnu_core::Error::internal(
                        "progress stream ended without a final result",
                    ))
                })
            }
        }
    }
}

/// Uniform facade over an execution engine
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Stable name used for registration, routing and breaker accounting
    fn name(&self) -> &str;

    /// Which engine family this adapter belongs to
    fn variant(&self) -> AdapterVariant;

    /// Prepare the engine; called once before the first execution.
    /// A startup failure trips the adapter's breaker immediately.
    async fn initialize(&self) -> Result<()>;

    /// Current health as seen by the adapter itself
    async fn health(&self) -> AdapterHealth;

    /// Execute one step; cancellation is observed at every suspension point
    async fn execute(&self, request: StepRequest, cancel: CancellationToken)
        -> Result<StepOutcome>;

    /// Request cancellation of a step already handed to the engine
    async fn cancel(&self, workflow_id: WorkflowId, step: &str) -> Result<()>;

    /// Release engine resources; failures are logged, never retried
    async fn shutdown(&self) -> Result<()>;
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

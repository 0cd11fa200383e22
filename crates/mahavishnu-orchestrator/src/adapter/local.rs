//! Local adapter
//!
//! Executes registered handler functions in-process. Handlers are keyed by
//! operation name and run inside the worker's cancellation scope.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mahavishnu_core::{Error, Result, WorkflowId};

use super::{Adapter, AdapterHealth, AdapterVariant, StepOutcome, StepRequest};

/// Handler function executing one operation
pub type StepHandler =
    Arc<dyn Fn(StepRequest) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// In-process execution engine
///
/// # Example
///
/// ```ignore
/// let adapter = LocalAdapter::new("local");
/// adapter.register_handler("echo", |request| async move {
///     Ok(request.payload)
/// });
/// ```
pub struct LocalAdapter {
    name: String,
    handlers: RwLock<HashMap<String, StepHandler>>,
}

impl LocalAdapter {
    /// Create an adapter with no handlers registered
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for an operation
    pub fn register_handler<F, Fut>(&self, operation: &str, handler: F)
    where
        F: Fn(StepRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let handler: StepHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.handlers
            .write()
            .insert(operation.to_string(), handler);
    }

    /// Operations with a registered handler
    pub fn operations(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> AdapterVariant {
        AdapterVariant::Local
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> AdapterHealth {
        AdapterHealth::Healthy
    }

    async fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        let handler = self
            .handlers
            .read()
            .get(&request.operation)
            .cloned()
            .ok_or_else(|| {
                Error::not_found("no handler registered for operation")
                    .with_context("operation", &request.operation)
                    .with_context("adapter", &self.name)
            })?;

        let operation = request.operation.clone();
        tokio::select! {
            result = handler(request) => result.map(StepOutcome::Completed),
            _ = cancel.cancelled() => {
                debug!(%operation, "local execution cancelled");
                Err(Error::cancelled("step cancelled during local execution")
                    .with_context("operation", operation))
            }
        }
    }

    async fn cancel(&self, _workflow_id: WorkflowId, _step: &str) -> Result<()> {
        // In-process work is cancelled through the token handed to execute
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.handlers.write().clear();
        Ok(())
    }
}

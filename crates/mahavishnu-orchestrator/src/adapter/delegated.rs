//! Delegated adapter
//!
//! Forwards each step to another server's task surface behind the
//! [`TaskSurfaceClient`] seam. Tests inject a fake client; production wires
//! the reqwest-backed [`HttpTaskSurfaceClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mahavishnu_core::{Error, Result, WorkflowId};

use super::{Adapter, AdapterHealth, AdapterVariant, StepOutcome, StepRequest};

/// Typed client for a downstream task surface
#[async_trait]
pub trait TaskSurfaceClient: Send + Sync + 'static {
    /// Forward a step and wait for its result
    async fn forward(&self, request: &StepRequest) -> Result<serde_json::Value>;

    /// Ask the downstream server to cancel a forwarded step
    async fn cancel(&self, workflow_id: WorkflowId, step: &str) -> Result<()>;

    /// Downstream health probe
    async fn health(&self) -> Result<()>;
}

/// HTTP implementation of [`TaskSurfaceClient`]
pub struct HttpTaskSurfaceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaskSurfaceClient {
    /// Create a client against `base_url`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| Error::internal("failed to build http client").with_source(err))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn downstream_error(err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::timeout("downstream task surface timed out").with_source(err)
        } else {
            Error::dependency_down("downstream task surface unreachable").with_source(err)
        }
    }
}

#[async_trait]
impl TaskSurfaceClient for HttpTaskSurfaceClient {
    async fn forward(&self, request: &StepRequest) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/v1/steps", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(Self::downstream_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::dependency_down("downstream task surface rejected the step")
                .with_context("status", status)
                .with_context("step", &request.step));
        }

        response.json().await.map_err(Self::downstream_error)
    }

    async fn cancel(&self, workflow_id: WorkflowId, step: &str) -> Result<()> {
        self.client
            .post(format!(
                "{}/v1/steps/{workflow_id}/{step}/cancel",
                self.base_url
            ))
            .send()
            .await
            .map_err(Self::downstream_error)?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(Self::downstream_error)?;
        if !response.status().is_success() {
            return Err(Error::dependency_down("downstream health probe failed")
                .with_context("status", response.status()));
        }
        Ok(())
    }
}

/// Adapter forwarding to another server's task surface
pub struct DelegatedAdapter {
    name: String,
    client: Arc<dyn TaskSurfaceClient>,
}

impl DelegatedAdapter {
    /// Create an adapter over the given client
    pub fn new(name: impl Into<String>, client: Arc<dyn TaskSurfaceClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl Adapter for DelegatedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> AdapterVariant {
        AdapterVariant::Delegated
    }

    async fn initialize(&self) -> Result<()> {
        self.client.health().await
    }

    async fn health(&self) -> AdapterHealth {
        match self.client.health().await {
            Ok(()) => AdapterHealth::Healthy,
            Err(err) => AdapterHealth::Unhealthy {
                reason: err.to_string(),
            },
        }
    }

    async fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        tokio::select! {
            result = self.client.forward(&request) => result.map(StepOutcome::Completed),
            _ = cancel.cancelled() => {
                debug!(step = %request.step, "delegated execution cancelled, notifying downstream");
                let _ = self.client.cancel(request.workflow_id, &request.step).await;
                Err(Error::cancelled("step cancelled while delegated")
                    .with_context("step", request.step))
            }
        }
    }

    async fn cancel(&self, workflow_id: WorkflowId, step: &str) -> Result<()> {
        self.client.cancel(workflow_id, step).await
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mahavishnu_core::{CorrelationId, ErrorKind, IdGenerator};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSurface {
        fail_first: AtomicU32,
        cancels: AtomicU32,
    }

    #[async_trait]
    impl TaskSurfaceClient for FakeSurface {
        async fn forward(&self, request: &StepRequest) -> Result<serde_json::Value> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::dependency_down("surface down"));
            }
            Ok(json!({"echo": request.payload}))
        }

        async fn cancel(&self, _workflow_id: WorkflowId, _step: &str) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn request(ids: &IdGenerator) -> StepRequest {
        StepRequest {
            workflow_id: WorkflowId::generate(ids),
            step: "run".into(),
            operation: "echo".into(),
            payload: json!({"x": 2}),
            timeout: Duration::from_secs(5),
            correlation_id: CorrelationId::generate(ids),
        }
    }

    #[tokio::test]
    async fn test_forwards_and_returns_result() {
        let ids = IdGenerator::new();
        let adapter = DelegatedAdapter::new(
            "delegated",
            Arc::new(FakeSurface {
                fail_first: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
            }),
        );

        let outcome = adapter
            .execute(request(&ids), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.into_result().await.unwrap(),
            json!({"echo": {"x": 2}})
        );
    }

    #[tokio::test]
    async fn test_downstream_failure_surfaces_dependency_down() {
        let ids = IdGenerator::new();
        let adapter = DelegatedAdapter::new(
            "delegated",
            Arc::new(FakeSurface {
                fail_first: AtomicU32::new(1),
                cancels: AtomicU32::new(0),
            }),
        );

        let err = adapter
            .execute(request(&ids), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyDown);
    }

    #[tokio::test]
    async fn test_cancel_notifies_downstream() {
        let ids = IdGenerator::new();
        let surface = Arc::new(FakeSurface {
            fail_first: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
        });
        let adapter = DelegatedAdapter::new("delegated", surface.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = adapter.execute(request(&ids), cancel).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(surface.cancels.load(Ordering::SeqCst), 1);
    }
}

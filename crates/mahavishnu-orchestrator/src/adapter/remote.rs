//! Remote adapter
//!
//! Submits steps to an orchestrator cluster and polls for the outcome.
//! The cluster is reached through the [`ClusterClient`] seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mahavishnu_core::{Error, Result, WorkflowId};

use super::{Adapter, AdapterHealth, AdapterVariant, StepOutcome, StepRequest};

/// Status of a task submitted to the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    Pending,
    Running,
    Succeeded { result: serde_json::Value },
    Failed { error: String },
}

/// Typed client for an orchestrator cluster
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Submit a step; returns the cluster's task handle
    async fn submit(&self, request: &StepRequest) -> Result<String>;

    /// Poll a submitted task
    async fn status(&self, remote_id: &str) -> Result<RemoteTaskStatus>;

    /// Cancel a submitted task
    async fn cancel(&self, remote_id: &str) -> Result<()>;

    /// Cluster health probe
    async fn health(&self) -> Result<()>;
}

/// HTTP implementation of [`ClusterClient`]
pub struct HttpClusterClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClusterClient {
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

    fn cluster_error(err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::timeout("cluster request timed out").with_source(err)
        } else {
            Error::dependency_down("cluster unreachable").with_source(err)
        }
    }
}

#[derive(Deserialize)]
struct SubmitAck {
    id: String,
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn submit(&self, request: &StepRequest) -> Result<String> {
        let ack: SubmitAck = self
            .client
            .post(format!("{}/v1/tasks", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(Self::cluster_error)?
            .error_for_status()
            .map_err(Self::cluster_error)?
            .json()
            .await
            .map_err(Self::cluster_error)?;
        Ok(ack.id)
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteTaskStatus> {
        self.client
            .get(format!("{}/v1/tasks/{remote_id}", self.base_url))
            .send()
            .await
            .map_err(Self::cluster_error)?
            .error_for_status()
            .map_err(Self::cluster_error)?
            .json()
            .await
            .map_err(Self::cluster_error)
    }

    async fn cancel(&self, remote_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/v1/tasks/{remote_id}/cancel", self.base_url))
            .send()
            .await
            .map_err(Self::cluster_error)?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(Self::cluster_error)?
            .error_for_status()
            .map_err(Self::cluster_error)?;
        Ok(())
    }
}

/// Adapter submitting to an orchestrator cluster
pub struct RemoteAdapter {
    name: String,
    client: Arc<dyn ClusterClient>,
    poll_interval: Duration,
}

impl RemoteAdapter {
    /// Create an adapter over the given client
    pub fn new(name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            name: name.into(),
            client,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Set the status poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Adapter for RemoteAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> AdapterVariant {
        AdapterVariant::Remote
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
        let remote_id = self.client.submit(&request).await?;
        debug!(step = %request.step, %remote_id, "submitted to cluster");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.client.status(&remote_id).await? {
                        RemoteTaskStatus::Pending | RemoteTaskStatus::Running => continue,
                        RemoteTaskStatus::Succeeded { result } => {
                            return Ok(StepOutcome::Completed(result));
                        }
                        RemoteTaskStatus::Failed { error } => {
                            return Err(Error::dependency_down("cluster task failed")
                                .with_context("remote_id", remote_id)
                                .with_context("error", error));
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = self.client.cancel(&remote_id).await;
                    return Err(Error::cancelled("step cancelled on cluster")
                        .with_context("remote_id", remote_id));
                }
            }
        }
    }

    async fn cancel(&self, _workflow_id: WorkflowId, _step: &str) -> Result<()> {
        // Cancellation of in-flight work happens through the execute token,
        // which knows the cluster-side task handle
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

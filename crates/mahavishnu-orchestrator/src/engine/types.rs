//! Workflow engine types

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mahavishnu_core::{Priority, WorkflowId};

use crate::persistence::WorkflowStatus;
use crate::reliability::RetryPolicy;
use crate::router::RoutingStrategy;

/// Step status within a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    RetryableFail,
    TerminalFail,
    Cancelled,
}

/// One step of a task type's workflow
///
/// The smallest unit of work with its own retry, timeout and breaker
/// envelope. The submitted task params are the payload of every step;
/// outputs of earlier steps ride along in the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// Step name, unique within the workflow
    pub name: String,

    /// Handler key the adapter dispatches on
    pub operation: String,

    /// Retry override; the engine default applies otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-step timeout override
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_millis")]
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    /// A step whose operation equals its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            operation: name.clone(),
            name,
            retry: None,
            timeout: None,
        }
    }

    /// Set the handler operation
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Set the retry override
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the timeout override
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Task submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: String,

    /// Opaque task parameters, validated at the adapter boundary
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Explicit adapter; resolution order applies otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,

    /// Pin the workflow to one pool, bypassing routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<mahavishnu_core::PoolId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Absolute deadline; the configured default applies otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_strategy: Option<RoutingStrategy>,

    /// Tenant key for per-tenant admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    #[serde(default)]
    pub priority: Priority,
}

impl SubmitRequest {
    /// A minimal submission for one task type
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            params: BTreeMap::new(),
            adapter: None,
            pool_id: None,
            idempotency_key: None,
            deadline: None,
            routing_strategy: None,
            tenant: None,
            priority: Priority::Normal,
        }
    }

    /// Add one parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Set the adapter
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Set the idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the tenant key
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// Accepted submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub workflow_id: WorkflowId,
    pub accepted_at: DateTime<Utc>,

    /// Advisory flag: the system is operating in degraded mode
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Cancellation acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub cancelled_at: DateTime<Utc>,
    pub current_step: Option<String>,
}

/// Checkpoint summary in a status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub step: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Workflow status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,

    /// Completed steps over total steps, in [0, 1]
    pub progress: f64,

    pub last_step: Option<String>,
    pub checkpoints: Vec<CheckpointSummary>,
}

/// Serde support for Option<Duration> as milliseconds
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

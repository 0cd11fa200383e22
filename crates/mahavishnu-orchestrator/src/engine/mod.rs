//! Checkpointed workflow execution

#[allow(clippy::module_inception)]
mod engine;
mod types;

pub use engine::{EngineConfig, WorkflowEngine};
pub use types::{
    CancelReceipt, CheckpointSummary, StepDefinition, StepStatus, SubmitReceipt, SubmitRequest,
    WorkflowStatusReport,
};

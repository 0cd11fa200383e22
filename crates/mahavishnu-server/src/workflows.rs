//! Task submission and workflow HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;

use mahavishnu_core::WorkflowId;
use mahavishnu_orchestrator::engine::{CancelReceipt, SubmitReceipt, SubmitRequest, WorkflowStatusReport};
use mahavishnu_orchestrator::persistence::{WorkflowFilter, WorkflowRecord, WorkflowStatus};
use mahavishnu_orchestrator::Orchestrator;

use crate::common::ListResponse;
use crate::error::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Query parameters for listing workflows
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListWorkflowsParams {
    pub status: Option<String>,
    pub adapter: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    100
}

/// Request body for cancelling a workflow
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/workflows", get(list_workflows))
        .route("/v1/workflows/:workflow_id", get(workflow_status))
        .route("/v1/workflows/:workflow_id/cancel", post(cancel_workflow))
        .route("/v1/workflows/:workflow_id/resume", post(resume_workflow))
        .route("/v1/workflows/:workflow_id/audit", get(workflow_audit))
        .with_state(state)
}

fn parse_workflow_id(raw: &str) -> Result<WorkflowId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError(
            mahavishnu_core::Error::invalid("malformed workflow id").with_context("value", raw),
        )
    })
}

fn parse_status(raw: &str) -> Result<WorkflowStatus, ApiError> {
    match raw {
        "created" => Ok(WorkflowStatus::Created),
        "running" => Ok(WorkflowStatus::Running),
        "succeeded" => Ok(WorkflowStatus::Succeeded),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(ApiError(
            mahavishnu_core::Error::invalid("unknown workflow status")
                .with_context("value", other),
        )),
    }
}

/// POST /v1/tasks - Submit a task
#[utoipa::path(
    post,
    path = "/v1/tasks",
    responses(
        (status = 200, description = "Task accepted"),
        (status = 409, description = "Idempotency key reused with different params"),
        (status = 429, description = "Admission rejected")
    ),
    tag = "workflows"
)]
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let receipt = state.orchestrator.engine.submit(request).await?;
    Ok(Json(receipt))
}

/// GET /v1/workflows - List workflows
#[utoipa::path(
    get,
    path = "/v1/workflows",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("adapter" = Option<String>, Query, description = "Filter by adapter"),
        ("limit" = Option<u32>, Query, description = "Max number of results (default 100)"),
        ("offset" = Option<u32>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "List of workflow records")
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<ListResponse<WorkflowRecord>>, ApiError> {
    let status = params.status.as_deref().map(parse_status).transpose()?;
    let records = state
        .orchestrator
        .engine
        .list(WorkflowFilter {
            status,
            adapter: params.adapter,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;
    Ok(Json(records.into()))
}

/// GET /v1/workflows/:workflow_id - Status with checkpoints
#[utoipa::path(
    get,
    path = "/v1/workflows/{workflow_id}",
    params(("workflow_id" = String, Path, description = "Workflow id")),
    responses(
        (status = 200, description = "Workflow status report"),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowStatusReport>, ApiError> {
    let workflow_id = parse_workflow_id(&workflow_id)?;
    let report = state.orchestrator.engine.status(workflow_id).await?;
    Ok(Json(report))
}

/// POST /v1/workflows/:workflow_id/cancel - Cancel a workflow
#[utoipa::path(
    post,
    path = "/v1/workflows/{workflow_id}/cancel",
    params(("workflow_id" = String, Path, description = "Workflow id")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Cancellation acknowledged"),
        (status = 404, description = "Unknown workflow"),
        (status = 409, description = "Workflow already finished")
    ),
    tag = "workflows"
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelReceipt>, ApiError> {
    let workflow_id = parse_workflow_id(&workflow_id)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let receipt = state.orchestrator.engine.cancel(workflow_id, reason).await?;
    Ok(Json(receipt))
}

/// POST /v1/workflows/:workflow_id/resume - Resume from the last checkpoint
#[utoipa::path(
    post,
    path = "/v1/workflows/{workflow_id}/resume",
    params(("workflow_id" = String, Path, description = "Workflow id")),
    responses(
        (status = 200, description = "Workflow resumed"),
        (status = 404, description = "Unknown workflow"),
        (status = 409, description = "Workflow already finished or executing")
    ),
    tag = "workflows"
)]
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let workflow_id = parse_workflow_id(&workflow_id)?;
    let receipt = state.orchestrator.engine.resume(workflow_id).await?;
    Ok(Json(receipt))
}

/// GET /v1/workflows/:workflow_id/audit - Audit trail
#[utoipa::path(
    get,
    path = "/v1/workflows/{workflow_id}/audit",
    params(("workflow_id" = String, Path, description = "Workflow id")),
    responses(
        (status = 200, description = "Append-only audit events")
    ),
    tag = "workflows"
)]
pub async fn workflow_audit(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ListResponse<mahavishnu_orchestrator::persistence::AuditEvent>>, ApiError> {
    let workflow_id = parse_workflow_id(&workflow_id)?;
    let events = state.orchestrator.engine.audit(workflow_id).await?;
    Ok(Json(events.into()))
}

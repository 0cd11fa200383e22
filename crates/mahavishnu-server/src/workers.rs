//! Worker admin HTTP routes
//!
//! Direct worker operations for operators: spawn into a pool, execute on a
//! specific worker, fan a batch out, poll status, collect batch results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use mahavishnu_core::{CorrelationId, PoolId, WorkerId, WorkflowId};
use mahavishnu_orchestrator::adapter::StepRequest;
use mahavishnu_orchestrator::worker::WorkerSnapshot;
use mahavishnu_orchestrator::Orchestrator;

use crate::common::ListResponse;
use crate::error::ApiError;

/// Stored outcome of one batch entry
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchEntryResult {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle of a submitted batch
pub enum BatchState {
    Pending,
    Done(Vec<BatchEntryResult>),
}

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub batches: Arc<DashMap<String, BatchState>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            batches: Arc::new(DashMap::new()),
        }
    }
}

/// Request to spawn workers into a pool
#[derive(Debug, Deserialize, ToSchema)]
pub struct SpawnRequest {
    pub pool_id: String,
    pub count: usize,
}

/// Request to execute on one worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct WorkerExecuteRequest {
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// One entry of a batch execution
#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchEntry {
    pub worker_id: String,
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Request to fan a batch out over workers
#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchRequest {
    pub entries: Vec<BatchEntry>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Batch acknowledgement
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchAck {
    pub batch_id: String,
}

/// Request to poll specific workers
#[derive(Debug, Deserialize, ToSchema)]
pub struct MonitorRequest {
    pub worker_ids: Vec<String>,
}

/// Create worker admin routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workers", get(health))
        .route("/v1/workers/spawn", post(spawn))
        .route("/v1/workers/monitor", post(monitor))
        .route("/v1/workers/execute_batch", post(execute_batch))
        .route("/v1/workers/close_all", post(close_all))
        .route("/v1/workers/collect_results/:batch_id", get(collect_results))
        .route("/v1/workers/:worker_id/execute", post(execute))
        .route("/v1/workers/:worker_id/close", post(close))
        .with_state(state)
}

fn parse_worker_id(raw: &str) -> Result<WorkerId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError(mahavishnu_core::Error::invalid("malformed worker id").with_context("value", raw))
    })
}

fn step_request(
    orchestrator: &Orchestrator,
    operation: String,
    payload: serde_json::Value,
    timeout_ms: u64,
) -> StepRequest {
    StepRequest {
        workflow_id: WorkflowId::generate(&orchestrator.ids),
        step: "admin".into(),
        operation,
        payload,
        timeout: Duration::from_millis(timeout_ms),
        correlation_id: CorrelationId::generate(&orchestrator.ids),
    }
}

/// GET /v1/workers - Snapshots of every worker
#[utoipa::path(
    get,
    path = "/v1/workers",
    responses((status = 200, description = "Worker snapshots across pools")),
    tag = "workers"
)]
pub async fn health(State(state): State<AppState>) -> Json<ListResponse<WorkerSnapshot>> {
    let snapshots: Vec<WorkerSnapshot> = state
        .orchestrator
        .pools
        .list()
        .into_iter()
        .flat_map(|pool| state.orchestrator.workers.pool_snapshots(pool.id))
        .collect();
    Json(snapshots.into())
}

/// POST /v1/workers/spawn - Grow a pool by `count` workers
#[utoipa::path(
    post,
    path = "/v1/workers/spawn",
    request_body = SpawnRequest,
    responses(
        (status = 200, description = "Workers spawned"),
        (status = 429, description = "Worker cap reached")
    ),
    tag = "workers"
)]
pub async fn spawn(
    State(state): State<AppState>,
    Json(request): Json<SpawnRequest>,
) -> Result<Json<ListResponse<WorkerSnapshot>>, ApiError> {
    let pool_id: PoolId = request.pool_id.parse().map_err(|_| {
        ApiError(mahavishnu_core::Error::invalid("malformed pool id"))
    })?;

    // Spawning through scale keeps the pool's worker list authoritative
    let snapshot = state.orchestrator.pools.health(pool_id)?;
    let target = snapshot.metrics.active_workers + request.count;
    state.orchestrator.pools.scale(pool_id, target).await?;
    Ok(Json(state.orchestrator.workers.pool_snapshots(pool_id).into()))
}

/// POST /v1/workers/:worker_id/execute - Execute on one worker
#[utoipa::path(
    post,
    path = "/v1/workers/{worker_id}/execute",
    params(("worker_id" = String, Path, description = "Worker id")),
    request_body = WorkerExecuteRequest,
    responses(
        (status = 200, description = "Execution result"),
        (status = 404, description = "Unknown worker")
    ),
    tag = "workers"
)]
pub async fn execute(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(request): Json<WorkerExecuteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    let step = step_request(
        &state.orchestrator,
        request.operation,
        request.payload,
        request.timeout_ms,
    );
    let result = state
        .orchestrator
        .workers
        .execute(worker_id, step, CancellationToken::new())
        .await?;
    Ok(Json(result))
}

/// POST /v1/workers/execute_batch - Fan out with bounded parallelism
///
/// Returns a batch id immediately; fetch the outcome through
/// `collect_results`.
#[utoipa::path(
    post,
    path = "/v1/workers/execute_batch",
    request_body = BatchRequest,
    responses((status = 202, description = "Batch accepted", body = BatchAck)),
    tag = "workers"
)]
pub async fn execute_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchAck>, ApiError> {
    let mut entries = Vec::with_capacity(request.entries.len());
    for entry in request.entries {
        let worker_id = parse_worker_id(&entry.worker_id)?;
        entries.push((
            worker_id,
            step_request(
                &state.orchestrator,
                entry.operation,
                entry.payload,
                request.timeout_ms,
            ),
        ));
    }

    let batch_id = WorkflowId::generate(&state.orchestrator.ids).to_string();
    state.batches.insert(batch_id.clone(), BatchState::Pending);

    let batches = Arc::clone(&state.batches);
    let workers = Arc::clone(&state.orchestrator.workers);
    let key = batch_id.clone();
    tokio::spawn(async move {
        let results: HashMap<WorkerId, mahavishnu_core::Result<serde_json::Value>> =
            workers.execute_batch(entries, CancellationToken::new()).await;
        let collected = results
            .into_iter()
            .map(|(worker_id, result)| match result {
                Ok(value) => BatchEntryResult {
                    worker_id: worker_id.to_string(),
                    result: Some(value),
                    error: None,
                },
                Err(err) => BatchEntryResult {
                    worker_id: worker_id.to_string(),
                    result: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        batches.insert(key, BatchState::Done(collected));
    });

    Ok(Json(BatchAck { batch_id }))
}

/// GET /v1/workers/collect_results/:batch_id - Collect a batch outcome
#[utoipa::path(
    get,
    path = "/v1/workers/collect_results/{batch_id}",
    params(("batch_id" = String, Path, description = "Batch id")),
    responses(
        (status = 200, description = "Batch results"),
        (status = 202, description = "Batch still executing"),
        (status = 404, description = "Unknown batch")
    ),
    tag = "workers"
)]
pub async fn collect_results(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<ListResponse<BatchEntryResult>>, ApiError> {
    match state.batches.get(&batch_id) {
        Some(entry) => match &*entry {
            BatchState::Pending => Err(ApiError(
                mahavishnu_core::Error::exhausted("batch still executing")
                    .with_context("batch_id", batch_id)
                    .with_retry_after(Duration::from_millis(250)),
            )),
            BatchState::Done(results) => Ok(Json(results.clone().into())),
        },
        None => Err(ApiError(
            mahavishnu_core::Error::not_found("unknown batch").with_context("batch_id", batch_id),
        )),
    }
}

/// POST /v1/workers/monitor - Polled status for specific workers
#[utoipa::path(
    post,
    path = "/v1/workers/monitor",
    request_body = MonitorRequest,
    responses((status = 200, description = "Worker statuses")),
    tag = "workers"
)]
pub async fn monitor(
    State(state): State<AppState>,
    Json(request): Json<MonitorRequest>,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let mut ids = Vec::with_capacity(request.worker_ids.len());
    for raw in &request.worker_ids {
        ids.push(parse_worker_id(raw)?);
    }
    let statuses = state
        .orchestrator
        .workers
        .monitor(&ids)
        .into_iter()
        .map(|(id, status)| (id.to_string(), status.to_string()))
        .collect();
    Ok(Json(statuses))
}

/// POST /v1/workers/:worker_id/close - Close one worker gracefully
#[utoipa::path(
    post,
    path = "/v1/workers/{worker_id}/close",
    params(("worker_id" = String, Path, description = "Worker id")),
    responses(
        (status = 200, description = "Worker closed"),
        (status = 404, description = "Unknown worker")
    ),
    tag = "workers"
)]
pub async fn close(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let worker_id = parse_worker_id(&worker_id)?;
    state.orchestrator.workers.close(worker_id, true).await?;
    Ok(Json(serde_json::json!({"closed": worker_id.to_string()})))
}

/// POST /v1/workers/close_all - Close every worker gracefully
#[utoipa::path(
    post,
    path = "/v1/workers/close_all",
    responses((status = 200, description = "All workers closed")),
    tag = "workers"
)]
pub async fn close_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.orchestrator.workers.close_all().await;
    Json(serde_json::json!({"closed": "all"}))
}

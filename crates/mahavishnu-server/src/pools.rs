//! Pool admin HTTP routes

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use mahavishnu_core::{CorrelationId, PoolId, WorkflowId};
use mahavishnu_orchestrator::adapter::StepRequest;
use mahavishnu_orchestrator::pool::{MemoryHit, PoolSnapshot, PoolSpec};
use mahavishnu_orchestrator::router::{RouteQuery, RoutingStrategy};
use mahavishnu_orchestrator::worker::WorkerSnapshot;
use mahavishnu_orchestrator::Orchestrator;
use tokio_util::sync::CancellationToken;

use crate::common::ListResponse;
use crate::error::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Request to execute a payload on a pool
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    /// Handler key the adapter dispatches on
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-call deadline in milliseconds (default 30000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Request to route-and-execute without naming a pool
#[derive(Debug, Deserialize, ToSchema)]
pub struct RouteExecuteRequest {
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Restrict to pools bound to this adapter
    pub adapter: Option<String>,
    #[serde(default)]
    pub strategy: Option<RoutingStrategy>,
}

/// Request to scale a pool
#[derive(Debug, Deserialize, ToSchema)]
pub struct ScaleRequest {
    pub target: usize,
}

/// Result of a direct pool execution
#[derive(Debug, Serialize, ToSchema)]
pub struct ExecuteResponse {
    pub result: serde_json::Value,
}

/// Memory search parameters
#[derive(Debug, Deserialize, ToSchema)]
pub struct MemorySearchParams {
    pub q: String,
    #[serde(default = "default_memory_limit")]
    pub limit: usize,
}

fn default_memory_limit() -> usize {
    20
}

/// Create pool admin routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/pools", get(list_pools).post(spawn_pool))
        .route("/v1/pools/close_all", post(close_all))
        .route("/v1/pools/route_execute", post(route_execute))
        .route("/v1/pools/memory/search", get(search_memory))
        .route("/v1/pools/:pool_id", get(pool_health))
        .route("/v1/pools/:pool_id/execute", post(execute))
        .route("/v1/pools/:pool_id/scale", post(scale))
        .route("/v1/pools/:pool_id/drain", post(drain))
        .route("/v1/pools/:pool_id/close", post(close))
        .route("/v1/pools/:pool_id/workers", get(monitor))
        .with_state(state)
}

fn parse_pool_id(raw: &str) -> Result<PoolId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError(mahavishnu_core::Error::invalid("malformed pool id").with_context("value", raw))
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

/// POST /v1/pools - Spawn a pool
#[utoipa::path(
    post,
    path = "/v1/pools",
    responses(
        (status = 200, description = "Pool created and running"),
        (status = 400, description = "Invalid pool bounds")
    ),
    tag = "pools"
)]
pub async fn spawn_pool(
    State(state): State<AppState>,
    Json(spec): Json<PoolSpec>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    let pool_id = state.orchestrator.pools.spawn_pool(spec).await?;
    Ok(Json(state.orchestrator.pools.health(pool_id)?))
}

/// GET /v1/pools - List pools with metrics
#[utoipa::path(
    get,
    path = "/v1/pools",
    responses((status = 200, description = "Pool snapshots")),
    tag = "pools"
)]
pub async fn list_pools(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<PoolSnapshot>>, ApiError> {
    Ok(Json(state.orchestrator.pools.list().into()))
}

/// GET /v1/pools/:pool_id - Pool health and metrics
#[utoipa::path(
    get,
    path = "/v1/pools/{pool_id}",
    params(("pool_id" = String, Path, description = "Pool id")),
    responses(
        (status = 200, description = "Pool snapshot"),
        (status = 404, description = "Unknown pool")
    ),
    tag = "pools"
)]
pub async fn pool_health(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    Ok(Json(state.orchestrator.pools.health(pool_id)?))
}

/// POST /v1/pools/:pool_id/execute - Execute on a specific pool
#[utoipa::path(
    post,
    path = "/v1/pools/{pool_id}/execute",
    params(("pool_id" = String, Path, description = "Pool id")),
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Execution result", body = ExecuteResponse),
        (status = 429, description = "Pool saturated")
    ),
    tag = "pools"
)]
pub async fn execute(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    let step = step_request(
        &state.orchestrator,
        request.operation,
        request.payload,
        request.timeout_ms,
    );
    let result = state
        .orchestrator
        .pools
        .execute(pool_id, step, CancellationToken::new())
        .await?;
    Ok(Json(ExecuteResponse { result }))
}

/// POST /v1/pools/route_execute - Route, then execute
#[utoipa::path(
    post,
    path = "/v1/pools/route_execute",
    request_body = RouteExecuteRequest,
    responses(
        (status = 200, description = "Execution result", body = ExecuteResponse),
        (status = 429, description = "No eligible pool")
    ),
    tag = "pools"
)]
pub async fn route_execute(
    State(state): State<AppState>,
    Json(request): Json<RouteExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let degraded = state.orchestrator.health.is_degraded();
    let pool_id = state
        .orchestrator
        .router
        .route(
            &RouteQuery {
                adapter: request.adapter.clone(),
                worker_type: None,
                strategy: request.strategy.clone(),
            },
            degraded,
        )
        .await?;
    let step = step_request(
        &state.orchestrator,
        request.operation,
        request.payload,
        request.timeout_ms,
    );
    let result = state
        .orchestrator
        .pools
        .execute(pool_id, step, CancellationToken::new())
        .await?;
    Ok(Json(ExecuteResponse { result }))
}

/// POST /v1/pools/:pool_id/scale - Scale to a target worker count
#[utoipa::path(
    post,
    path = "/v1/pools/{pool_id}/scale",
    params(("pool_id" = String, Path, description = "Pool id")),
    request_body = ScaleRequest,
    responses(
        (status = 200, description = "Scaled"),
        (status = 400, description = "Target outside pool bounds"),
        (status = 409, description = "Concurrent scale in flight")
    ),
    tag = "pools"
)]
pub async fn scale(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    state.orchestrator.pools.scale(pool_id, request.target).await?;
    Ok(Json(state.orchestrator.pools.health(pool_id)?))
}

/// POST /v1/pools/:pool_id/drain - Complete in-flight work, then close
#[utoipa::path(
    post,
    path = "/v1/pools/{pool_id}/drain",
    params(("pool_id" = String, Path, description = "Pool id")),
    responses((status = 200, description = "Pool drained and closed")),
    tag = "pools"
)]
pub async fn drain(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    state.orchestrator.pools.drain(pool_id).await?;
    Ok(Json(state.orchestrator.pools.health(pool_id)?))
}

/// POST /v1/pools/:pool_id/close - Close without the grace period
#[utoipa::path(
    post,
    path = "/v1/pools/{pool_id}/close",
    params(("pool_id" = String, Path, description = "Pool id")),
    responses((status = 200, description = "Pool closed")),
    tag = "pools"
)]
pub async fn close(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    state.orchestrator.pools.close(pool_id).await?;
    Ok(Json(state.orchestrator.pools.health(pool_id)?))
}

/// POST /v1/pools/close_all - Close every pool
#[utoipa::path(
    post,
    path = "/v1/pools/close_all",
    responses((status = 200, description = "All pools closed")),
    tag = "pools"
)]
pub async fn close_all(State(state): State<AppState>) -> Json<ListResponse<PoolSnapshot>> {
    state.orchestrator.pools.close_all().await;
    Json(state.orchestrator.pools.list().into())
}

/// GET /v1/pools/:pool_id/workers - Worker snapshots of one pool
#[utoipa::path(
    get,
    path = "/v1/pools/{pool_id}/workers",
    params(("pool_id" = String, Path, description = "Pool id")),
    responses((status = 200, description = "Worker snapshots")),
    tag = "pools"
)]
pub async fn monitor(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<ListResponse<WorkerSnapshot>>, ApiError> {
    let pool_id = parse_pool_id(&pool_id)?;
    // Confirm the pool exists before listing its workers
    state.orchestrator.pools.health(pool_id)?;
    Ok(Json(state.orchestrator.workers.pool_snapshots(pool_id).into()))
}

/// GET /v1/pools/memory/search - Federated pool-local memory search
#[utoipa::path(
    get,
    path = "/v1/pools/memory/search",
    params(
        ("q" = String, Query, description = "Substring query"),
        ("limit" = Option<usize>, Query, description = "Max hits (default 20)")
    ),
    responses((status = 200, description = "Memory hits across pools")),
    tag = "pools"
)]
pub async fn search_memory(
    State(state): State<AppState>,
    Query(params): Query<MemorySearchParams>,
) -> Json<ListResponse<MemoryHit>> {
    Json(
        state
            .orchestrator
            .pools
            .search_memory(&params.q, params.limit)
            .into(),
    )
}

//! Adapter admin HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use mahavishnu_orchestrator::adapter::AdapterSummary;
use mahavishnu_orchestrator::Orchestrator;

use crate::common::ListResponse;
use crate::error::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Create adapter admin routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/adapters", get(list_adapters))
        .route("/v1/adapters/:name/enable", post(enable))
        .route("/v1/adapters/:name/disable", post(disable))
        .route("/v1/adapters/:name/health", get(adapter_health))
        .with_state(state)
}

/// GET /v1/adapters - List adapters with health and breaker state
#[utoipa::path(
    get,
    path = "/v1/adapters",
    responses((status = 200, description = "Adapter summaries")),
    tag = "adapters"
)]
pub async fn list_adapters(
    State(state): State<AppState>,
) -> Json<ListResponse<AdapterSummary>> {
    Json(state.orchestrator.adapters.list().await.into())
}

/// POST /v1/adapters/:name/enable - Enable an adapter
#[utoipa::path(
    post,
    path = "/v1/adapters/{name}/enable",
    params(("name" = String, Path, description = "Adapter name")),
    responses(
        (status = 200, description = "Adapter enabled"),
        (status = 404, description = "Unknown adapter")
    ),
    tag = "adapters"
)]
pub async fn enable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ListResponse<AdapterSummary>>, ApiError> {
    state.orchestrator.adapters.set_enabled(&name, true)?;
    Ok(Json(state.orchestrator.adapters.list().await.into()))
}

/// POST /v1/adapters/:name/disable - Disable an adapter
#[utoipa::path(
    post,
    path = "/v1/adapters/{name}/disable",
    params(("name" = String, Path, description = "Adapter name")),
    responses(
        (status = 200, description = "Adapter disabled"),
        (status = 404, description = "Unknown adapter")
    ),
    tag = "adapters"
)]
pub async fn disable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ListResponse<AdapterSummary>>, ApiError> {
    state.orchestrator.adapters.set_enabled(&name, false)?;
    Ok(Json(state.orchestrator.adapters.list().await.into()))
}

/// GET /v1/adapters/:name/health - One adapter's health
#[utoipa::path(
    get,
    path = "/v1/adapters/{name}/health",
    params(("name" = String, Path, description = "Adapter name")),
    responses(
        (status = 200, description = "Adapter health"),
        (status = 404, description = "Unknown adapter")
    ),
    tag = "adapters"
)]
pub async fn adapter_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = state.orchestrator.adapters.get(&name)?;
    let health = adapter.health().await;
    let breaker = state.orchestrator.breakers.breaker(&name).snapshot();
    Ok(Json(serde_json::json!({
        "name": name,
        "health": health,
        "breaker": breaker,
    })))
}

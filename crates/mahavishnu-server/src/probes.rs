//! Liveness, readiness and deep health probes

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{extract::State, routing::get, Json, Router};

use mahavishnu_orchestrator::health::{ComponentHealth, ComponentReport, LivenessReport, ReadinessReport};
use mahavishnu_orchestrator::Orchestrator;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Create probe routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .route("/health/components", get(components))
        .with_state(state)
}

/// GET /health - Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Process is alive"),
        (status = 503, description = "Process is wedged")
    ),
    tag = "probes"
)]
pub async fn liveness(
    State(state): State<AppState>,
) -> (StatusCode, Json<LivenessReport>) {
    let report = state.orchestrator.health.liveness().await;
    let status = if report.alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /ready - Readiness probe
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Accepting work"),
        (status = 503, description = "Not ready")
    ),
    tag = "probes"
)]
pub async fn readiness(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessReport>) {
    let report = state.orchestrator.health.readiness().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /health/components - Deep component report
#[utoipa::path(
    get,
    path = "/health/components",
    responses(
        (status = 200, description = "Component health report"),
        (status = 503, description = "A component is unhealthy")
    ),
    tag = "probes"
)]
pub async fn components(
    State(state): State<AppState>,
) -> (StatusCode, Json<ComponentReport>) {
    let report = state.orchestrator.health.components().await;
    let status = match report.overall {
        ComponentHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

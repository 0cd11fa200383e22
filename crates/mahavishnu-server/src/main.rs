// Mahavishnu orchestration server
// Decision: HTTP is the shipped transport; the contracts stay transport-agnostic
// Decision: Store backends pick themselves from the environment - PostgreSQL
//           when DATABASE_URL is set, filesystem checkpoints + in-memory records otherwise

mod adapters;
mod common;
mod error;
mod pools;
mod probes;
mod workers;
mod workflows;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use mahavishnu_core::Config;
use mahavishnu_orchestrator::adapter::{Adapter, LocalAdapter};
use mahavishnu_orchestrator::persistence::{
    CheckpointStore, FsCheckpointStore, InMemoryWorkflowStore, PostgresCheckpointStore,
    PostgresWorkflowStore, WorkflowStore,
};
use mahavishnu_orchestrator::pool::PoolSpec;
use mahavishnu_orchestrator::Orchestrator;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::submit_task,
        workflows::list_workflows,
        workflows::workflow_status,
        workflows::cancel_workflow,
        workflows::resume_workflow,
        workflows::workflow_audit,
        pools::spawn_pool,
        pools::list_pools,
        pools::pool_health,
        pools::execute,
        pools::route_execute,
        pools::scale,
        pools::drain,
        pools::close,
        pools::close_all,
        pools::monitor,
        pools::search_memory,
        workers::health,
        workers::spawn,
        workers::execute,
        workers::execute_batch,
        workers::collect_results,
        workers::monitor,
        workers::close,
        workers::close_all,
        adapters::list_adapters,
        adapters::enable,
        adapters::disable,
        adapters::adapter_health,
        probes::liveness,
        probes::readiness,
        probes::components,
    ),
    components(schemas(
        error::ErrorBody,
        workflows::ListWorkflowsParams,
        workflows::CancelRequest,
        pools::ExecuteRequest,
        pools::RouteExecuteRequest,
        pools::ScaleRequest,
        pools::ExecuteResponse,
        pools::MemorySearchParams,
        workers::SpawnRequest,
        workers::WorkerExecuteRequest,
        workers::BatchEntry,
        workers::BatchRequest,
        workers::BatchAck,
        workers::BatchEntryResult,
        workers::MonitorRequest,
    )),
    tags(
        (name = "workflows", description = "Task submission and workflow lifecycle"),
        (name = "pools", description = "Pool administration"),
        (name = "workers", description = "Worker administration"),
        (name = "adapters", description = "Adapter administration"),
        (name = "probes", description = "Liveness and readiness probes")
    ),
    info(
        title = "Mahavishnu API",
        version = "0.2.0",
        description = "Multi-pool worker orchestrator for AI-agent and data workflows",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mahavishnu=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("mahavishnu-server starting...");

    let config = Config::from_env().context("Failed to load configuration")?;

    // Pick the store backends
    let (workflows_store, checkpoints_store): (Arc<dyn WorkflowStore>, Arc<dyn CheckpointStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = sqlx::PgPool::connect(url)
                    .await
                    .context("Failed to connect to database")?;
                let workflow_store = PostgresWorkflowStore::new(pool.clone());
                workflow_store
                    .migrate()
                    .await
                    .context("Workflow store migration failed")?;
                let checkpoint_store = PostgresCheckpointStore::new(
                    pool,
                    config.storage.checkpoint_max_size_bytes,
                );
                checkpoint_store
                    .migrate()
                    .await
                    .context("Checkpoint store migration failed")?;
                tracing::info!("Using PostgreSQL stores");
                (Arc::new(workflow_store), Arc::new(checkpoint_store))
            }
            None => {
                let checkpoint_store = FsCheckpointStore::new(
                    config.storage.checkpoint_store_path.clone(),
                    config.storage.checkpoint_max_size_bytes,
                )
                .await
                .map_err(|err| anyhow::anyhow!("checkpoint store unavailable: {err}"))?;
                tracing::info!(
                    path = %config.storage.checkpoint_store_path.display(),
                    "Using filesystem checkpoint store with in-memory workflow records"
                );
                (
                    Arc::new(InMemoryWorkflowStore::new()),
                    Arc::new(checkpoint_store),
                )
            }
        };

    let bind_addr = config.bind_addr.clone();
    let orchestrator = Arc::new(Orchestrator::new(config, workflows_store, checkpoints_store));

    // Built-in local adapter with the echo smoke-test operation
    let local = LocalAdapter::new("local");
    local.register_handler("echo", |request| async move { Ok(request.payload) });
    let adapter: Arc<dyn Adapter> = Arc::new(local);
    orchestrator.adapters.register(adapter);
    for (name, result) in orchestrator.adapters.initialize_all().await {
        match result {
            Ok(()) => tracing::info!(adapter = %name, "adapter initialized"),
            Err(err) => tracing::warn!(adapter = %name, error = %err, "adapter startup failed"),
        }
    }

    // A default pool so the server is ready out of the box
    let default_pool = orchestrator
        .pools
        .spawn_pool(PoolSpec {
            worker_type: "general".into(),
            adapter: "local".into(),
            min_workers: 1,
            max_workers: orchestrator.config.concurrency.max_concurrent_workers_per_pool,
            backpressure: None,
        })
        .await
        .map_err(|err| anyhow::anyhow!("failed to spawn default pool: {err}"))?;
    tracing::info!(pool_id = %default_pool, "default pool running");

    // Background maintenance: adapter init retries, worker recycling,
    // checkpoint GC, degraded-flag refresh
    let shutdown = CancellationToken::new();
    let maintenance = orchestrator.start_maintenance(Duration::from_secs(10), shutdown.clone());

    let app = build_router(Arc::clone(&orchestrator));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = maintenance.await;
    orchestrator.shutdown().await;
    tracing::info!("mahavishnu-server stopped");
    Ok(())
}

fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(workflows::routes(workflows::AppState {
            orchestrator: Arc::clone(&orchestrator),
        }))
        .merge(pools::routes(pools::AppState {
            orchestrator: Arc::clone(&orchestrator),
        }))
        .merge(workers::routes(workers::AppState::new(Arc::clone(
            &orchestrator,
        ))))
        .merge(adapters::routes(adapters::AppState {
            orchestrator: Arc::clone(&orchestrator),
        }))
        .merge(probes::routes(probes::AppState { orchestrator }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

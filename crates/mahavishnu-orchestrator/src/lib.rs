//! # Mahavishnu Orchestrator
//!
//! Multi-pool worker orchestrator for AI-agent and data workflows:
//!
//! - **Pools and workers**: homogeneous worker fleets with min/max scaling,
//!   heartbeats, draining and recycling
//! - **Routing and admission**: strategy-based pool selection behind a
//!   global admission gate and per-tenant rate limits
//! - **Resilience**: circuit breakers per dependency, retry policies with
//!   full jitter, deadlines on every call
//! - **Checkpointed workflows**: atomic, versioned checkpoints enabling
//!   resume after failure or restart
//! - **Health**: liveness/readiness probes and a component report that
//!   governs degraded operation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                        │
//! │   (sequential steps, retry · breaker · timeout, resume)     │
//! └─────────────────────────────────────────────────────────────┘
//!        │ admission → routing                │ checkpoints
//!        ▼                                    ▼
//! ┌──────────────────────────┐   ┌─────────────────────────────┐
//! │    Router / Admission    │   │  CheckpointStore/WorkflowStore │
//! └──────────────────────────┘   │  (memory, filesystem, Postgres) │
//!        │                       └─────────────────────────────┘
//!        ▼
//! ┌──────────────────────────┐   ┌─────────────────────────────┐
//! │  PoolManager → Workers   │──►│   AdapterRegistry           │
//! │  (scale, drain, metrics) │   │   (local/delegated/remote)  │
//! └──────────────────────────┘   └─────────────────────────────┘
//! ```

pub mod adapter;
pub mod engine;
pub mod health;
pub mod persistence;
pub mod pool;
pub mod reliability;
pub mod router;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapter::{Adapter, AdapterRegistry, AdapterVariant, LocalAdapter, StepRequest};
    pub use crate::engine::{StepDefinition, SubmitReceipt, SubmitRequest, WorkflowEngine};
    pub use crate::persistence::{
        CheckpointStore, FsCheckpointStore, InMemoryCheckpointStore, InMemoryWorkflowStore,
        WorkflowStatus, WorkflowStore,
    };
    pub use crate::pool::{PoolManager, PoolSpec};
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::router::RoutingStrategy;
    pub use crate::Orchestrator;
}

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use mahavishnu_core::{Config, EventBus, IdGenerator};

use adapter::AdapterRegistry;
use engine::{EngineConfig, WorkflowEngine};
use health::{HealthSupervisor, SchedulerPulse};
use persistence::{CheckpointStore, InMemoryCheckpointStore, InMemoryWorkflowStore, WorkflowStore};
use pool::{PoolManager, PoolManagerConfig};
use reliability::{BreakerRegistry, CircuitBreakerConfig, RetryPolicy};
use router::{AdmissionConfig, AdmissionController, Router, RoutingStrategy};
use worker::{WorkerManager, WorkerManagerConfig};

/// Composition root wiring every component
///
/// One explicit context passed through constructors; tests build a fresh
/// `Orchestrator` per case, so nothing lives in globals.
pub struct Orchestrator {
    pub config: Config,
    pub ids: Arc<IdGenerator>,
    pub events: EventBus,
    pub breakers: Arc<BreakerRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub workers: Arc<WorkerManager>,
    pub pools: Arc<PoolManager>,
    pub router: Arc<Router>,
    pub admission: Arc<AdmissionController>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub engine: Arc<WorkflowEngine>,
    pub health: Arc<HealthSupervisor>,
}

impl Orchestrator {
    /// Wire an orchestrator over the given stores
    pub fn new(
        config: Config,
        workflows: Arc<dyn WorkflowStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let ids = Arc::new(IdGenerator::new());
        let events = EventBus::default();
        let pulse = Arc::new(SchedulerPulse::new());
        let degraded = Arc::new(AtomicBool::new(false));

        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::from(
            &config.breaker,
        )));
        let adapters = Arc::new(AdapterRegistry::new(Arc::clone(&breakers)));

        let workers = Arc::new(WorkerManager::new(
            WorkerManagerConfig::default()
                .with_max_concurrent_workers(
                    config
                        .concurrency
                        .max_concurrent_workers_per_pool
                        .saturating_mul(8)
                        .max(64),
                )
                .with_heartbeat_timeout(config.deadlines.worker_heartbeat_timeout)
                .with_cancel_grace(config.deadlines.cancel_grace_period),
            Arc::clone(&ids),
        ));

        let pools = Arc::new(PoolManager::new(
            PoolManagerConfig {
                max_workers_per_pool: config.concurrency.max_concurrent_workers_per_pool,
                admission_wait: config.concurrency.admission_wait,
                ..Default::default()
            },
            Arc::clone(&ids),
            Arc::clone(&workers),
            Arc::clone(&adapters),
            Arc::clone(&breakers),
        ));

        let router = Arc::new(Router::new(
            Arc::clone(&pools),
            RoutingStrategy::LeastLoaded,
            config.concurrency.admission_wait,
        ));

        let admission = Arc::new(AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: config.concurrency.max_concurrent_workflows,
            admission_wait: config.concurrency.admission_wait,
            ..Default::default()
        }));

        let engine = Arc::new(WorkflowEngine::new(
            EngineConfig {
                default_task_timeout: config.deadlines.default_task_timeout,
                default_retry: RetryPolicy::from(&config.retry),
                checkpoint_retention: Duration::from_secs(
                    config.storage.checkpoint_retention_on_failure_days as u64 * 24 * 3600,
                ),
                idempotency_window: Duration::from_secs(24 * 3600),
            },
            Arc::clone(&ids),
            Arc::clone(&workflows),
            Arc::clone(&checkpoints),
            Arc::clone(&adapters),
            Arc::clone(&pools),
            Arc::clone(&router),
            Arc::clone(&breakers),
            Arc::clone(&admission),
            events.clone(),
            Arc::clone(&pulse),
            Arc::clone(&degraded),
        ));

        let health = Arc::new(HealthSupervisor::new(
            config.health.clone(),
            pulse,
            Arc::clone(&adapters),
            Arc::clone(&breakers),
            Arc::clone(&pools),
            Arc::clone(&workers),
            Arc::clone(&checkpoints),
            Arc::clone(&workflows),
            config.deadlines.worker_heartbeat_timeout,
            degraded,
        ));

        Self {
            config,
            ids,
            events,
            breakers,
            adapters,
            workers,
            pools,
            router,
            admission,
            checkpoints,
            workflows,
            engine,
            health,
        }
    }

    /// An orchestrator over in-memory stores, for tests and local runs
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    /// Run background maintenance until the token is cancelled
    ///
    /// One pass retries failed adapter startups, recycles stale workers,
    /// refreshes the degraded flag and collects expired checkpoints.
    pub fn start_maintenance(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let health = Arc::clone(&self.health);
        let checkpoints = Arc::clone(&self.checkpoints);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        health.tick().await;
                        if let Err(err) = checkpoints.gc_expired(chrono::Utc::now()).await {
                            warn!(error = %err, "checkpoint GC failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Graceful shutdown: close pools and workers, shut adapters down
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        self.workers.close_all().await;
        self.adapters.shutdown_all().await;
    }
}

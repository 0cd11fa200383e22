//! Pool router
//!
//! Applies the eligibility filter, then the routing strategy. Eligibility:
//! pool state is running, the adapter breaker is closed or half-open, and
//! estimated headroom is at least one. When every candidate is saturated,
//! the router waits up to the bounded admission wait before failing
//! `Exhausted`.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use mahavishnu_core::{Error, PoolId, Result};

use crate::pool::{PoolManager, PoolSnapshot, PoolState};
use crate::reliability::CircuitState;

use super::strategy::RoutingStrategy;

/// Routing constraints for one task
#[derive(Debug, Clone, Default)]
pub struct RouteQuery {
    /// Restrict to pools bound to this adapter
    pub adapter: Option<String>,

    /// Restrict to pools hosting this worker type
    pub worker_type: Option<String>,

    /// Strategy override; the router default applies otherwise
    pub strategy: Option<RoutingStrategy>,
}

/// Selects a pool per task
pub struct Router {
    pools: Arc<PoolManager>,
    default_strategy: RoutingStrategy,
    admission_wait: Duration,
    ring: AtomicUsize,
}

impl Router {
    /// Create a router over the pool manager
    pub fn new(
        pools: Arc<PoolManager>,
        default_strategy: RoutingStrategy,
        admission_wait: Duration,
    ) -> Self {
        Self {
            pools,
            default_strategy,
            admission_wait,
            ring: AtomicUsize::new(0),
        }
    }

    /// Pools passing the eligibility filter
    ///
    /// In degraded mode, pools must additionally report verified headroom
    /// (currently accepting) rather than merely estimated capacity.
    pub fn eligible(&self, query: &RouteQuery, degraded: bool) -> Vec<PoolSnapshot> {
        self.candidates(query)
            .into_iter()
            .filter(|pool| {
                pool.state == PoolState::Running
                    && pool.metrics.breaker_state != CircuitState::Open
                    && pool.headroom >= 1
                    && (!degraded || pool.accepting)
            })
            .collect()
    }

    fn candidates(&self, query: &RouteQuery) -> Vec<PoolSnapshot> {
        self.pools
            .list()
            .into_iter()
            .filter(|pool| {
                query
                    .adapter
                    .as_ref()
                    .map_or(true, |adapter| &pool.adapter == adapter)
            })
            .filter(|pool| {
                query
                    .worker_type
                    .as_ref()
                    .map_or(true, |wt| &pool.worker_type == wt)
            })
            .collect()
    }

    /// Route a task to a pool
    ///
    /// Waits up to the admission wait while every candidate is saturated;
    /// fails `Exhausted` when no candidate exists at all or the wait
    /// elapses.
    #[instrument(skip(self, query), fields(adapter = ?query.adapter))]
    pub async fn route(&self, query: &RouteQuery, degraded: bool) -> Result<PoolId> {
        let strategy = query
            .strategy
            .clone()
            .unwrap_or_else(|| self.default_strategy.clone());
        let deadline = tokio::time::Instant::now() + self.admission_wait;

        loop {
            let eligible = self.eligible(query, degraded);
            if let Some(pool_id) = strategy.select(&eligible, &self.ring) {
                debug!(%pool_id, "routed");
                return Ok(pool_id);
            }

            // No eligible pool. If none could ever become eligible, fail
            // now; saturated-but-running pools are worth a bounded wait.
            let any_viable = self.candidates(query).into_iter().any(|pool| {
                pool.state == PoolState::Running
                    && pool.metrics.breaker_state != CircuitState::Open
            });
            if !any_viable {
                return Err(Error::exhausted("no eligible pool")
                    .with_context("adapter", query.adapter.as_deref().unwrap_or("any")));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::exhausted("all eligible pools saturated")
                    .with_retry_after(self.admission_wait));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterRegistry, LocalAdapter};
    use crate::pool::{PoolManagerConfig, PoolSpec};
    use crate::reliability::{BreakerRegistry, CircuitBreakerConfig};
    use crate::worker::{WorkerManager, WorkerManagerConfig};
    use mahavishnu_core::{ErrorKind, IdGenerator};

    async fn fixture() -> (Router, Arc<PoolManager>, Arc<BreakerRegistry>) {
        let ids = Arc::new(IdGenerator::new());
        let breakers = Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::default().with_consecutive_threshold(1),
        ));
        let adapters = Arc::new(AdapterRegistry::new(breakers.clone()));
        let local = LocalAdapter::new("local");
        local.register_handler("echo", |request| async move { Ok(request.payload) });
        let adapter: Arc<dyn Adapter> = Arc::new(local);
        adapters.register(adapter);

        let workers = Arc::new(WorkerManager::new(
            WorkerManagerConfig::default(),
            ids.clone(),
        ));
        let pools = Arc::new(PoolManager::new(
            PoolManagerConfig::default(),
            ids,
            workers,
            adapters,
            breakers.clone(),
        ));
        let router = Router::new(
            pools.clone(),
            RoutingStrategy::LeastLoaded,
            Duration::from_millis(100),
        );
        (router, pools, breakers)
    }

    fn spec() -> PoolSpec {
        PoolSpec {
            worker_type: "general".into(),
            adapter: "local".into(),
            min_workers: 1,
            max_workers: 2,
            backpressure: None,
        }
    }

    #[tokio::test]
    async fn test_routes_to_running_pool() {
        let (router, pools, _) = fixture().await;
        let pool_id = pools.spawn_pool(spec()).await.unwrap();

        let routed = router.route(&RouteQuery::default(), false).await.unwrap();
        assert_eq!(routed, pool_id);
    }

    #[tokio::test]
    async fn test_no_pools_is_exhausted() {
        let (router, _, _) = fixture().await;
        let err = router
            .route(&RouteQuery::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_open_breaker_pool_is_skipped() {
        let (router, pools, breakers) = fixture().await;
        pools.spawn_pool(spec()).await.unwrap();
        breakers.breaker("local").trip();

        let err = router
            .route(&RouteQuery::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_adapter_filter_restricts_candidates() {
        let (router, pools, _) = fixture().await;
        pools.spawn_pool(spec()).await.unwrap();

        let query = RouteQuery {
            adapter: Some("other".into()),
            ..Default::default()
        };
        let err = router.route(&query, false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_closed_pool_not_eligible() {
        let (router, pools, _) = fixture().await;
        let pool_id = pools.spawn_pool(spec()).await.unwrap();
        pools.drain(pool_id).await.unwrap();

        let err = router
            .route(&RouteQuery::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }
}

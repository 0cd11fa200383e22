//! Pool manager
//!
//! Owns every pool: spawning, execution dispatch, serialized scaling,
//! draining, closing, health reporting and the federated memory search.
//! Scale and close are single-writer per pool; snapshot reads are lock-free.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mahavishnu_core::{Error, IdGenerator, PoolId, Result, WorkerId};

use crate::adapter::{AdapterRegistry, StepRequest};
use crate::reliability::BreakerRegistry;
use crate::worker::{BackpressureConfig, WorkerManager, WorkerStatus};

use super::pool::{MemoryHit, Pool, PoolSnapshot, PoolState};

/// Pool manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolManagerConfig {
    /// Worker cap applied to each pool's max_workers
    pub max_workers_per_pool: usize,

    /// Bounded wait for pool headroom before failing `Exhausted`
    #[serde(with = "duration_millis")]
    pub admission_wait: Duration,

    /// Minimum fraction of scale-up spawns that must succeed
    pub scale_up_success_ratio: f64,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            max_workers_per_pool: 16,
            admission_wait: Duration::from_secs(2),
            scale_up_success_ratio: 0.5,
        }
    }
}

/// Specification for a new pool
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PoolSpec {
    /// Worker type the pool hosts
    pub worker_type: String,

    /// Adapter name the workers execute through
    pub adapter: String,

    pub min_workers: usize,
    pub max_workers: usize,

    /// Backpressure watermarks
    #[serde(default)]
    pub backpressure: Option<BackpressureConfig>,
}

/// Manager for every pool in the process
pub struct PoolManager {
    config: PoolManagerConfig,
    ids: Arc<IdGenerator>,
    pools: DashMap<PoolId, Arc<Pool>>,
    workers: Arc<WorkerManager>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<BreakerRegistry>,
}

impl PoolManager {
    /// Create a new pool manager
    pub fn new(
        config: PoolManagerConfig,
        ids: Arc<IdGenerator>,
        workers: Arc<WorkerManager>,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            config,
            ids,
            pools: DashMap::new(),
            workers,
            adapters,
            breakers,
        }
    }

    fn pool(&self, pool_id: PoolId) -> Result<Arc<Pool>> {
        self.pools
            .get(&pool_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found("unknown pool").with_context("pool_id", pool_id))
    }

    /// Create a pool and bring it to `Running` with `min_workers` workers
    #[instrument(skip(self, spec), fields(worker_type = %spec.worker_type, adapter = %spec.adapter))]
    pub async fn spawn_pool(&self, spec: PoolSpec) -> Result<PoolId> {
        if spec.min_workers > spec.max_workers {
            return Err(Error::invalid("min_workers must not exceed max_workers")
                .with_context("min", spec.min_workers)
                .with_context("max", spec.max_workers));
        }
        if spec.max_workers == 0 || spec.max_workers > self.config.max_workers_per_pool {
            return Err(Error::invalid("max_workers outside the allowed range")
                .with_context("max", spec.max_workers)
                .with_context("cap", self.config.max_workers_per_pool));
        }

        let adapter = self.adapters.get(&spec.adapter)?;
        let pool_id = PoolId::generate(&self.ids);
        let pool = Arc::new(Pool::new(
            pool_id,
            spec.worker_type.clone(),
            spec.adapter.clone(),
            adapter.variant(),
            spec.min_workers,
            spec.max_workers,
            spec.backpressure.unwrap_or_default(),
        ));

        // Spawn the initial fleet before the pool is visible to routing
        let spawned = self.spawn_workers(&pool, spec.min_workers)?;
        debug!(%pool_id, spawned = spawned.len(), "initial workers spawned");

        pool.transition(PoolState::Running)?;
        self.pools.insert(pool_id, pool);
        info!(%pool_id, "pool running");
        Ok(pool_id)
    }

    fn spawn_workers(&self, pool: &Arc<Pool>, count: usize) -> Result<Vec<WorkerId>> {
        let adapter = self.adapters.get(&pool.adapter_name)?;
        let spawned = self
            .workers
            .spawn(pool.id, &pool.worker_type, count, adapter)?;
        pool.workers.write().extend(&spawned);
        Ok(spawned)
    }

    /// Execute a payload on the pool
    ///
    /// Blocks up to `admission_wait` for headroom, then fails `Exhausted`.
    /// The payload goes to the accepting worker with the shallowest queue.
    #[instrument(skip(self, request, cancel), fields(%pool_id, step = %request.step))]
    pub async fn execute(
        &self,
        pool_id: PoolId,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let pool = self.pool(pool_id)?;
        self.wait_for_headroom(&pool).await?;

        let worker_id = self.pick_worker(&pool).ok_or_else(|| {
            Error::exhausted("no accepting worker in pool").with_context("pool_id", pool_id)
        })?;

        pool.backpressure.task_started();
        let started = tokio::time::Instant::now();
        let step = request.step.clone();
        let result = self.workers.execute(worker_id, request, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        pool.backpressure.task_completed();

        match &result {
            Ok(value) => {
                pool.metrics.record_completed(elapsed_ms);
                pool.memory.record(pool_id, &step, value.clone());
            }
            Err(_) => pool.metrics.record_failed(elapsed_ms),
        }
        result
    }

    async fn wait_for_headroom(&self, pool: &Arc<Pool>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.admission_wait;
        loop {
            match pool.state() {
                PoolState::Running => {}
                state => {
                    return Err(Error::exhausted("pool is not accepting work")
                        .with_context("pool_id", pool.id)
                        .with_context("state", state));
                }
            }
            if pool.backpressure.should_accept() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::exhausted("pool saturated")
                    .with_context("pool_id", pool.id)
                    .with_retry_after(self.config.admission_wait));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn pick_worker(&self, pool: &Arc<Pool>) -> Option<WorkerId> {
        let workers = pool.workers.read();
        workers
            .iter()
            .filter(|id| {
                self.workers
                    .status(**id)
                    .map(|s| s.is_accepting())
                    .unwrap_or(false)
            })
            .min_by_key(|id| self.workers.queue_depth(**id))
            .copied()
    }

    /// Scale the pool to `target` workers
    ///
    /// Serialized per pool: a concurrent scale fails with `Conflict`. Scale
    /// up tolerates individual spawn failures as long as at least half
    /// succeed, rolling back otherwise. Scale down drains busy workers.
    #[instrument(skip(self), fields(%pool_id, target))]
    pub async fn scale(&self, pool_id: PoolId, target: usize) -> Result<usize> {
        let pool = self.pool(pool_id)?;

        let _guard = pool.scale_lock.try_lock().map_err(|_| {
            Error::conflict("a scale operation is already in flight")
                .with_context("pool_id", pool_id)
        })?;

        if pool.state() != PoolState::Running {
            return Err(Error::conflict("pool is not running")
                .with_context("pool_id", pool_id)
                .with_context("state", pool.state()));
        }
        if target < pool.min_workers || target > pool.max_workers {
            return Err(Error::invalid("scale target outside pool bounds")
                .with_context("target", target)
                .with_context("min", pool.min_workers)
                .with_context("max", pool.max_workers));
        }

        self.prune_terminal_workers(&pool);
        let current = pool.active_workers();

        if target > current {
            let needed = target - current;
            let mut spawned = Vec::new();
            for _ in 0..needed {
                match self.spawn_workers(&pool, 1) {
                    Ok(mut ids) => spawned.append(&mut ids),
                    Err(err) => warn!(%pool_id, error = %err, "worker spawn failed during scale-up"),
                }
            }

            let ratio = spawned.len() as f64 / needed as f64;
            if ratio < self.config.scale_up_success_ratio {
                // Too many failures: roll the partial fleet back
                for id in &spawned {
                    let _ = self.workers.close(*id, false).await;
                }
                pool.workers.write().retain(|id| !spawned.contains(id));
                return Err(Error::exhausted("scale-up failed to spawn enough workers")
                    .with_context("pool_id", pool_id)
                    .with_context("requested", needed)
                    .with_context("spawned", spawned.len()));
            }
        } else if target < current {
            let excess = current - target;
            let victims = self.pick_scale_down_victims(&pool, excess);
            for id in &victims {
                // Graceful close refuses new work, completes the current
                // step, then exits
                let _ = self.workers.close(*id, true).await;
            }
            pool.workers.write().retain(|id| !victims.contains(id));
        }

        let now = pool.active_workers();
        info!(%pool_id, workers = now, "scale complete");
        Ok(now)
    }

    /// Idle workers first, then the busy ones
    fn pick_scale_down_victims(&self, pool: &Arc<Pool>, excess: usize) -> Vec<WorkerId> {
        let workers = pool.workers.read();
        let mut idle = Vec::new();
        let mut busy = Vec::new();
        for id in workers.iter() {
            match self.workers.status(*id) {
                Ok(WorkerStatus::Busy) => busy.push(*id),
                Ok(_) => idle.push(*id),
                Err(_) => idle.push(*id),
            }
        }
        idle.into_iter().chain(busy).take(excess).collect()
    }

    fn prune_terminal_workers(&self, pool: &Arc<Pool>) {
        let mut workers = pool.workers.write();
        workers.retain(|id| {
            self.workers
                .status(*id)
                .map(|s| !s.is_terminal())
                .unwrap_or(false)
        });
    }

    /// Drain the pool: refuse new work, complete in-flight, then close
    #[instrument(skip(self), fields(%pool_id))]
    pub async fn drain(&self, pool_id: PoolId) -> Result<()> {
        let pool = self.pool(pool_id)?;
        let _guard = pool.scale_lock.lock().await;

        pool.transition(PoolState::Draining)?;
        let workers: Vec<WorkerId> = pool.workers.read().clone();
        for id in workers {
            let _ = self.workers.close(id, true).await;
        }
        pool.workers.write().clear();
        pool.transition(PoolState::Closed)?;
        info!(%pool_id, "pool drained and closed");
        Ok(())
    }

    /// Close the pool immediately, without the grace period
    #[instrument(skip(self), fields(%pool_id))]
    pub async fn close(&self, pool_id: PoolId) -> Result<()> {
        let pool = self.pool(pool_id)?;
        let _guard = pool.scale_lock.lock().await;

        if pool.state() == PoolState::Running {
            pool.transition(PoolState::Draining)?;
        }
        let workers: Vec<WorkerId> = pool.workers.read().clone();
        for id in workers {
            let _ = self.workers.close(id, false).await;
        }
        pool.workers.write().clear();
        if pool.state() != PoolState::Closed {
            pool.transition(PoolState::Closed)?;
        }
        info!(%pool_id, "pool force closed");
        Ok(())
    }

    /// Close every pool
    pub async fn close_all(&self) {
        let ids: Vec<PoolId> = self.pools.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.close(id).await;
        }
    }

    /// Snapshot one pool
    pub fn health(&self, pool_id: PoolId) -> Result<PoolSnapshot> {
        let pool = self.pool(pool_id)?;
        Ok(self.snapshot_pool(&pool))
    }

    /// Snapshot every pool
    pub fn list(&self) -> Vec<PoolSnapshot> {
        let mut out: Vec<PoolSnapshot> = self
            .pools
            .iter()
            .map(|entry| self.snapshot_pool(entry.value()))
            .collect();
        out.sort_by_key(|snapshot| snapshot.id);
        out
    }

    fn snapshot_pool(&self, pool: &Arc<Pool>) -> PoolSnapshot {
        let queued: usize = pool
            .workers
            .read()
            .iter()
            .map(|id| {
                let depth = self.workers.queue_depth(*id);
                if depth == usize::MAX {
                    0
                } else {
                    depth
                }
            })
            .sum();
        let breaker_state = self.breakers.breaker(&pool.adapter_name).state();
        pool.snapshot(queued, breaker_state)
    }

    /// Number of pools eligible to take work
    pub fn accepting_pool_count(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().is_accepting())
            .count()
    }

    /// Search pool-local memories, federated across every pool
    pub fn search_memory(&self, query: &str, limit: usize) -> Vec<MemoryHit> {
        let mut hits = Vec::new();
        for entry in self.pools.iter() {
            hits.extend(entry.value().memory.search(query, limit));
        }
        hits.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        hits.truncate(limit);
        hits
    }

    /// Evict stale workers and respawn pools back up to their minimum
    ///
    /// Crashed workers are recycled: their capacity returns as fresh
    /// workers, subject to the global cap.
    pub async fn reconcile(&self) {
        let evicted = self.workers.sweep_stale();
        for (pool_id, worker_id) in &evicted {
            if let Some(pool) = self.pools.get(pool_id) {
                pool.workers.write().retain(|id| id != worker_id);
            }
        }

        for entry in self.pools.iter() {
            let pool = entry.value().clone();
            if pool.state() != PoolState::Running {
                continue;
            }
            self.prune_terminal_workers(&pool);
            let active = pool.active_workers();
            if active < pool.min_workers {
                let missing = pool.min_workers - active;
                match self.spawn_workers(&pool, missing) {
                    Ok(ids) => info!(pool_id = %pool.id, respawned = ids.len(), "recycled workers"),
                    Err(err) => {
                        warn!(pool_id = %pool.id, error = %err, "failed to respawn workers")
                    }
                }
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, LocalAdapter};
    use crate::reliability::CircuitBreakerConfig;
    use crate::worker::WorkerManagerConfig;
    use mahavishnu_core::{CorrelationId, ErrorKind, WorkflowId};
    use serde_json::json;

    fn fixture() -> (PoolManager, Arc<IdGenerator>) {
        let ids = Arc::new(IdGenerator::new());
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let adapters = Arc::new(AdapterRegistry::new(breakers.clone()));

        let local = LocalAdapter::new("local");
        local.register_handler("echo", |request| async move { Ok(request.payload) });
        local.register_handler("slow", |_request| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(null))
        });
        let adapter: Arc<dyn Adapter> = Arc::new(local);
        adapters.register(adapter);

        let workers = Arc::new(WorkerManager::new(
            WorkerManagerConfig::default(),
            ids.clone(),
        ));
        let manager = PoolManager::new(
            PoolManagerConfig {
                admission_wait: Duration::from_millis(100),
                ..Default::default()
            },
            ids.clone(),
            workers,
            adapters,
            breakers,
        );
        (manager, ids)
    }

    fn spec(min: usize, max: usize) -> PoolSpec {
        PoolSpec {
            worker_type: "general".into(),
            adapter: "local".into(),
            min_workers: min,
            max_workers: max,
            backpressure: None,
        }
    }

    fn request(ids: &IdGenerator, operation: &str) -> StepRequest {
        StepRequest {
            workflow_id: WorkflowId::generate(ids),
            step: "run".into(),
            operation: operation.into(),
            payload: json!({"k": "v"}),
            timeout: Duration::from_secs(5),
            correlation_id: CorrelationId::generate(ids),
        }
    }

    #[tokio::test]
    async fn test_spawn_pool_starts_min_workers() {
        let (manager, _ids) = fixture();
        let pool_id = manager.spawn_pool(spec(2, 4)).await.unwrap();

        let snapshot = manager.health(pool_id).unwrap();
        assert_eq!(snapshot.state, PoolState::Running);
        assert_eq!(snapshot.metrics.active_workers, 2);
    }

    #[tokio::test]
    async fn test_invalid_bounds_rejected() {
        let (manager, _ids) = fixture();
        let err = manager.spawn_pool(spec(4, 2)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_execute_through_pool() {
        let (manager, ids) = fixture();
        let pool_id = manager.spawn_pool(spec(1, 2)).await.unwrap();

        let result = manager
            .execute(pool_id, request(&ids, "echo"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"k": "v"}));

        let snapshot = manager.health(pool_id).unwrap();
        assert_eq!(snapshot.metrics.completed, 1);
    }

    #[tokio::test]
    async fn test_scale_within_bounds() {
        let (manager, _ids) = fixture();
        let pool_id = manager.spawn_pool(spec(1, 4)).await.unwrap();

        assert_eq!(manager.scale(pool_id, 3).await.unwrap(), 3);
        assert_eq!(manager.scale(pool_id, 1).await.unwrap(), 1);

        let err = manager.scale(pool_id, 5).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
        let err = manager.scale(pool_id, 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_concurrent_scale_conflicts() {
        let (manager, _ids) = fixture();
        let manager = Arc::new(manager);
        let pool_id = manager.spawn_pool(spec(1, 8)).await.unwrap();

        // Hold the scale lock and race a second scale against it
        let pool = manager.pool(pool_id).unwrap();
        let guard = pool.scale_lock.try_lock().unwrap();
        let err = manager.scale(pool_id, 4).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        drop(guard);

        assert_eq!(manager.scale(pool_id, 4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_drain_transitions_to_closed() {
        let (manager, ids) = fixture();
        let pool_id = manager.spawn_pool(spec(1, 2)).await.unwrap();

        manager.drain(pool_id).await.unwrap();
        let snapshot = manager.health(pool_id).unwrap();
        assert_eq!(snapshot.state, PoolState::Closed);

        // A closed pool refuses work
        let err = manager
            .execute(pool_id, request(&ids, "echo"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_search_memory_federates() {
        let (manager, ids) = fixture();
        let a = manager.spawn_pool(spec(1, 2)).await.unwrap();
        let b = manager.spawn_pool(spec(1, 2)).await.unwrap();

        let mut req_a = request(&ids, "echo");
        req_a.payload = json!({"text": "alpha result"});
        manager
            .execute(a, req_a, CancellationToken::new())
            .await
            .unwrap();
        let mut req_b = request(&ids, "echo");
        req_b.payload = json!({"text": "beta result"});
        manager
            .execute(b, req_b, CancellationToken::new())
            .await
            .unwrap();

        let hits = manager.search_memory("result", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(manager.search_memory("alpha", 10).len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_respawns_to_min() {
        let ids = Arc::new(IdGenerator::new());
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let adapters = Arc::new(AdapterRegistry::new(breakers.clone()));
        let local = LocalAdapter::new("local");
        local.register_handler("echo", |request| async move { Ok(request.payload) });
        let adapter: Arc<dyn Adapter> = Arc::new(local);
        adapters.register(adapter);

        // Zero heartbeat timeout: every worker goes stale immediately
        let workers = Arc::new(WorkerManager::new(
            WorkerManagerConfig::default()
                .with_heartbeat_interval(Duration::from_secs(3600))
                .with_heartbeat_timeout(Duration::ZERO),
            ids.clone(),
        ));
        let manager = PoolManager::new(
            PoolManagerConfig::default(),
            ids.clone(),
            workers,
            adapters,
            breakers,
        );

        let pool_id = manager.spawn_pool(spec(2, 4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.reconcile().await;
        let snapshot = manager.health(pool_id).unwrap();
        assert_eq!(snapshot.metrics.active_workers, 2);
    }
}

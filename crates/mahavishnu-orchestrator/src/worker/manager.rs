//! Worker manager
//!
//! Spawns, tracks, monitors and recycles workers across every pool. Worker
//! mutation (spawn/close) is serialized per worker; status reads are
//! lock-free off the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use mahavishnu_core::{Error, IdGenerator, PoolId, Result, WorkerId};

use crate::adapter::{RegisteredAdapter, StepRequest};

use super::worker::{WorkerHandle, WorkerSnapshot, WorkerStatus};

/// Worker manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerManagerConfig {
    /// Hard cap across all pools
    pub max_concurrent_workers: usize,

    /// Bounded inbox per worker
    pub inbox_capacity: usize,

    /// Worker liveness signal cadence
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Missing heartbeats for this long marks the worker crashed
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,

    /// Cooperative-cancel window before force kill
    #[serde(with = "duration_millis")]
    pub cancel_grace: Duration,

    /// Bounded parallelism for `execute_batch`
    pub batch_parallelism: usize,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 64,
            inbox_capacity: 16,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
            batch_parallelism: 4,
        }
    }
}

impl WorkerManagerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global worker cap
    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max.max(1);
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the cancel grace period
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Manager for all spawned workers
pub struct WorkerManager {
    config: WorkerManagerConfig,
    ids: Arc<IdGenerator>,
    workers: DashMap<WorkerId, Arc<WorkerHandle>>,
}

impl WorkerManager {
    /// Create a new manager
    pub fn new(config: WorkerManagerConfig, ids: Arc<IdGenerator>) -> Self {
        Self {
            config,
            ids,
            workers: DashMap::new(),
        }
    }

    /// Spawn `count` workers of one type into a pool
    ///
    /// Fails with `Exhausted` when the global worker cap would be exceeded;
    /// no workers are spawned in that case.
    #[instrument(skip(self, adapter), fields(%pool_id, worker_type, count))]
    pub fn spawn(
        &self,
        pool_id: PoolId,
        worker_type: &str,
        count: usize,
        adapter: Arc<RegisteredAdapter>,
    ) -> Result<Vec<WorkerId>> {
        let live = self.worker_count();
        if live + count > self.config.max_concurrent_workers {
            return Err(Error::exhausted("worker cap reached")
                .with_context("live", live)
                .with_context("requested", count)
                .with_context("cap", self.config.max_concurrent_workers));
        }

        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let id = WorkerId::generate(&self.ids);
            let handle = Arc::new(WorkerHandle::spawn(
                id,
                pool_id,
                worker_type,
                Arc::clone(&adapter),
                self.config.inbox_capacity,
                self.config.heartbeat_interval,
                self.config.cancel_grace,
            ));
            self.workers.insert(id, handle);
            spawned.push(id);
        }

        info!(spawned = spawned.len(), "workers spawned");
        Ok(spawned)
    }

    fn handle(&self, worker_id: WorkerId) -> Result<Arc<WorkerHandle>> {
        self.workers
            .get(&worker_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                Error::not_found("unknown worker").with_context("worker_id", worker_id)
            })
    }

    /// Execute a payload on a specific worker
    ///
    /// Returns when the worker completes the request or its deadline fires.
    pub async fn execute(
        &self,
        worker_id: WorkerId,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let handle = self.handle(worker_id)?;
        handle.execute(request, cancel).await
    }

    /// Fan a batch of payloads out over workers with bounded parallelism
    ///
    /// Individual failures land in the result map; the batch itself never
    /// short-circuits.
    pub async fn execute_batch(
        &self,
        requests: Vec<(WorkerId, StepRequest)>,
        cancel: CancellationToken,
    ) -> HashMap<WorkerId, Result<serde_json::Value>> {
        let mut pending = FuturesUnordered::new();
        let mut iter = requests.into_iter();
        let mut results = HashMap::new();

        loop {
            while pending.len() < self.config.batch_parallelism.max(1) {
                let Some((worker_id, request)) = iter.next() else {
                    break;
                };
                let handle = self.handle(worker_id);
                let cancel = cancel.clone();
                pending.push(async move {
                    let result = match handle {
                        Ok(handle) => handle.execute(request, cancel).await,
                        Err(err) => Err(err),
                    };
                    (worker_id, result)
                });
            }

            match pending.next().await {
                Some((worker_id, result)) => {
                    results.insert(worker_id, result);
                }
                None => break,
            }
        }

        results
    }

    /// Polled status for a set of workers
    pub fn monitor(&self, worker_ids: &[WorkerId]) -> HashMap<WorkerId, WorkerStatus> {
        worker_ids
            .iter()
            .filter_map(|id| {
                self.workers
                    .get(id)
                    .map(|handle| (*id, handle.status()))
            })
            .collect()
    }

    /// Snapshots of every worker in one pool
    pub fn pool_snapshots(&self, pool_id: PoolId) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .filter(|entry| entry.value().pool_id() == pool_id)
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Live worker ids of one pool
    pub fn pool_workers(&self, pool_id: PoolId) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|entry| {
                entry.value().pool_id() == pool_id && !entry.value().status().is_terminal()
            })
            .map(|entry| entry.value().id())
            .collect()
    }

    /// Total non-terminal workers
    pub fn worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count()
    }

    /// Queue depth of one worker, used for in-pool placement
    pub fn queue_depth(&self, worker_id: WorkerId) -> usize {
        self.workers
            .get(&worker_id)
            .map(|handle| handle.queue_depth())
            .unwrap_or(usize::MAX)
    }

    /// Status of one worker
    pub fn status(&self, worker_id: WorkerId) -> Result<WorkerStatus> {
        Ok(self.handle(worker_id)?.status())
    }

    /// Close one worker
    ///
    /// Graceful close drains: the current step completes, then the worker
    /// exits. Force close aborts immediately.
    #[instrument(skip(self), fields(%worker_id, graceful))]
    pub async fn close(&self, worker_id: WorkerId, graceful: bool) -> Result<()> {
        let (_, handle) = self
            .workers
            .remove(&worker_id)
            .ok_or_else(|| {
                Error::not_found("unknown worker").with_context("worker_id", worker_id)
            })?;

        if graceful {
            handle.drain();
            handle.join().await;
        } else {
            handle.force_close(WorkerStatus::Closed);
        }
        Ok(())
    }

    /// Close every worker, gracefully
    pub async fn close_all(&self) {
        let ids: Vec<WorkerId> = self.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.close(id, true).await;
        }
    }

    /// Evict workers whose heartbeat went stale
    ///
    /// Returns the evicted ids so pools can recycle capacity.
    pub fn sweep_stale(&self) -> Vec<(PoolId, WorkerId)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .unwrap_or(chrono::Duration::zero());

        let stale: Vec<(PoolId, WorkerId)> = self
            .workers
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                !handle.status().is_terminal() && handle.last_heartbeat() < cutoff
            })
            .map(|entry| (entry.value().pool_id(), entry.value().id()))
            .collect();

        for (_, worker_id) in &stale {
            if let Some((_, handle)) = self.workers.remove(worker_id) {
                handle.mark_crashed();
                warn!(%worker_id, "evicted stale worker");
            }
        }

        stale
    }

    /// Oldest heartbeat across live workers, used by the liveness probe
    pub fn oldest_heartbeat_age(&self) -> Option<Duration> {
        self.workers
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| {
                Utc::now()
                    .signed_duration_since(entry.value().last_heartbeat())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .max()
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
    use crate::adapter::{Adapter, AdapterRegistry, LocalAdapter};
    use crate::reliability::{BreakerRegistry, CircuitBreakerConfig};
    use mahavishnu_core::{CorrelationId, ErrorKind, WorkflowId};
    use serde_json::json;

    fn adapter() -> Arc<RegisteredAdapter> {
        let registry = AdapterRegistry::new(Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::default(),
        )));
        let local = LocalAdapter::new("local");
        local.register_handler("echo", |request| async move { Ok(request.payload) });
        let adapter: Arc<dyn Adapter> = Arc::new(local);
        registry.register(adapter)
    }

    fn manager(cap: usize) -> (WorkerManager, Arc<IdGenerator>) {
        let ids = Arc::new(IdGenerator::new());
        (
            WorkerManager::new(
                WorkerManagerConfig::default().with_max_concurrent_workers(cap),
                Arc::clone(&ids),
            ),
            ids,
        )
    }

    fn request(ids: &IdGenerator, payload: serde_json::Value) -> StepRequest {
        StepRequest {
            workflow_id: WorkflowId::generate(ids),
            step: "run".into(),
            operation: "echo".into(),
            payload,
            timeout: Duration::from_secs(5),
            correlation_id: CorrelationId::generate(ids),
        }
    }

    #[tokio::test]
    async fn test_spawn_respects_cap() {
        let (manager, ids) = manager(2);
        let pool = PoolId::generate(&ids);

        manager.spawn(pool, "general", 2, adapter()).unwrap();
        let err = manager
            .spawn(pool, "general", 1, adapter())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let (manager, ids) = manager(4);
        let pool = PoolId::generate(&ids);
        let workers = manager.spawn(pool, "general", 1, adapter()).unwrap();

        let result = manager
            .execute(
                workers[0],
                request(&ids, json!({"v": 7})),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 7}));
    }

    #[tokio::test]
    async fn test_execute_batch_collects_all_results() {
        let (manager, ids) = manager(8);
        let pool = PoolId::generate(&ids);
        let workers = manager.spawn(pool, "general", 3, adapter()).unwrap();

        let requests: Vec<(WorkerId, StepRequest)> = workers
            .iter()
            .enumerate()
            .map(|(n, id)| (*id, request(&ids, json!({"n": n}))))
            .collect();

        let results = manager
            .execute_batch(requests, CancellationToken::new())
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_batch_reports_unknown_worker() {
        let (manager, ids) = manager(8);
        let ghost = WorkerId::generate(&ids);

        let results = manager
            .execute_batch(
                vec![(ghost, request(&ids, json!({})))],
                CancellationToken::new(),
            )
            .await;
        assert_eq!(results[&ghost].as_ref().unwrap_err().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_monitor_reports_status() {
        let (manager, ids) = manager(4);
        let pool = PoolId::generate(&ids);
        let workers = manager.spawn(pool, "general", 2, adapter()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let statuses = manager.monitor(&workers);
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| *s == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_close_removes_worker() {
        let (manager, ids) = manager(4);
        let pool = PoolId::generate(&ids);
        let workers = manager.spawn(pool, "general", 1, adapter()).unwrap();

        manager.close(workers[0], true).await.unwrap();
        assert_eq!(manager.worker_count(), 0);
        assert!(manager.status(workers[0]).is_err());
    }

    #[tokio::test]
    async fn test_sweep_evicts_stale_workers() {
        let ids = Arc::new(IdGenerator::new());
        let manager = WorkerManager::new(
            WorkerManagerConfig::default()
                .with_heartbeat_interval(Duration::from_secs(3600))
                .with_heartbeat_timeout(Duration::ZERO),
            Arc::clone(&ids),
        );
        let pool = PoolId::generate(&ids);
        manager.spawn(pool, "general", 1, adapter()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = manager.sweep_stale();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, pool);
        assert_eq!(manager.worker_count(), 0);
    }
}

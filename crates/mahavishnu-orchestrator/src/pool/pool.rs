//! Pool record, state machine, metrics and pool-local memory

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use mahavishnu_core::{Error, PoolId, Result, WorkerId};

use crate::adapter::AdapterVariant;
use crate::reliability::CircuitState;
use crate::worker::{BackpressureConfig, BackpressureState};

/// Pool lifecycle state; never moves backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Created,
    Running,
    Draining,
    Closed,
}

impl PoolState {
    /// Forward-only transition check
    pub fn can_transition_to(&self, next: PoolState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Closed)
                | (Self::Running, Self::Draining)
                | (Self::Running, Self::Closed)
                | (Self::Draining, Self::Closed)
        )
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Execution counters for one pool
#[derive(Default)]
pub struct PoolMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl PoolMetrics {
    /// Record one completed step and its duration
    pub fn record_completed(&self, duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    /// Record one failed step and its duration
    pub fn record_failed(&self, duration_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    fn average_step_duration_ms(&self) -> u64 {
        let total = self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        if total == 0 {
            0
        } else {
            self.total_duration_ms.load(Ordering::Relaxed) / total
        }
    }
}

/// Queryable per-pool metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub average_step_duration_ms: u64,
    pub breaker_state: CircuitState,
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub id: PoolId,
    pub pool_type: AdapterVariant,
    pub worker_type: String,
    pub adapter: String,
    pub state: PoolState,
    pub min_workers: usize,
    pub max_workers: usize,
    pub metrics: PoolMetricsSnapshot,
    pub headroom: usize,
    pub accepting: bool,
}

/// One entry in a pool-local memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub pool_id: PoolId,
    pub step: String,
    pub content: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded pool-local memory of recent step results
///
/// Queried through `search_memory`, federated across pools by the manager.
pub struct PoolMemory {
    entries: RwLock<VecDeque<MemoryHit>>,
    capacity: usize,
}

impl PoolMemory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record a step result, evicting the oldest entry at capacity
    pub fn record(&self, pool_id: PoolId, step: &str, content: serde_json::Value) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(MemoryHit {
            pool_id,
            step: step.to_string(),
            content,
            recorded_at: Utc::now(),
        });
    }

    /// Case-insensitive substring search over step names and content
    pub fn search(&self, query: &str, limit: usize) -> Vec<MemoryHit> {
        let needle = query.to_lowercase();
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|hit| {
                hit.step.to_lowercase().contains(&needle)
                    || hit.content.to_string().to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

/// A named, scalable collection of homogeneous workers bound to one adapter
pub struct Pool {
    pub(crate) id: PoolId,
    pub(crate) worker_type: String,
    pub(crate) adapter_name: String,
    pub(crate) pool_type: AdapterVariant,
    pub(crate) min_workers: usize,
    pub(crate) max_workers: usize,
    state: RwLock<PoolState>,
    pub(crate) workers: RwLock<Vec<WorkerId>>,
    pub(crate) backpressure: BackpressureState,
    pub(crate) metrics: PoolMetrics,
    pub(crate) memory: PoolMemory,
    /// Serializes scale/drain/close; a held lock means a mutation in flight
    pub(crate) scale_lock: tokio::sync::Mutex<()>,
}

impl Pool {
    /// Create a pool in the `Created` state
    pub(crate) fn new(
        id: PoolId,
        worker_type: String,
        adapter_name: String,
        pool_type: AdapterVariant,
        min_workers: usize,
        max_workers: usize,
        backpressure: BackpressureConfig,
    ) -> Self {
        Self {
            id,
            worker_type,
            adapter_name,
            pool_type,
            min_workers,
            max_workers,
            state: RwLock::new(PoolState::Created),
            workers: RwLock::new(Vec::new()),
            backpressure: BackpressureState::new(backpressure, max_workers),
            metrics: PoolMetrics::default(),
            memory: PoolMemory::new(512),
            scale_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    /// Advance the state; backward moves are `Conflict`
    pub(crate) fn transition(&self, next: PoolState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(Error::conflict("pool state may not move backwards")
                .with_context("pool_id", self.id)
                .with_context("from", *state)
                .with_context("to", next));
        }
        *state = next;
        Ok(())
    }

    /// Live worker count
    pub fn active_workers(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether the pool can take a task right now
    pub fn is_accepting(&self) -> bool {
        self.state() == PoolState::Running && self.backpressure.should_accept()
    }

    pub(crate) fn snapshot(
        &self,
        queued_tasks: usize,
        breaker_state: CircuitState,
    ) -> PoolSnapshot {
        PoolSnapshot {
            id: self.id,
            pool_type: self.pool_type,
            worker_type: self.worker_type.clone(),
            adapter: self.adapter_name.clone(),
            state: self.state(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            metrics: PoolMetricsSnapshot {
                active_workers: self.active_workers(),
                queued_tasks,
                in_flight_tasks: self.backpressure.current_load(),
                completed: self.metrics.completed.load(Ordering::Relaxed),
                failed: self.metrics.failed.load(Ordering::Relaxed),
                average_step_duration_ms: self.metrics.average_step_duration_ms(),
                breaker_state,
            },
            headroom: self.backpressure.headroom(),
            accepting: self.is_accepting(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mahavishnu_core::IdGenerator;
    use serde_json::json;

    fn pool(ids: &IdGenerator) -> Pool {
        Pool::new(
            PoolId::generate(ids),
            "general".into(),
            "local".into(),
            AdapterVariant::Local,
            1,
            4,
            BackpressureConfig::default(),
        )
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let ids = IdGenerator::new();
        let p = pool(&ids);
        p.transition(PoolState::Running).unwrap();
        p.transition(PoolState::Draining).unwrap();
        assert!(p.transition(PoolState::Running).is_err());
        p.transition(PoolState::Closed).unwrap();
        assert!(p.transition(PoolState::Draining).is_err());
    }

    #[test]
    fn test_memory_search_matches_step_and_content() {
        let ids = IdGenerator::new();
        let p = pool(&ids);
        p.memory
            .record(p.id(), "summarize", json!({"topic": "orchestration"}));
        p.memory.record(p.id(), "ingest", json!({"rows": 10}));

        assert_eq!(p.memory.search("summarize", 10).len(), 1);
        assert_eq!(p.memory.search("ORCHESTRATION", 10).len(), 1);
        assert_eq!(p.memory.search("nothing", 10).len(), 0);
    }

    #[test]
    fn test_memory_capacity_evicts_oldest() {
        let ids = IdGenerator::new();
        let p = pool(&ids);
        for n in 0..600 {
            p.memory.record(p.id(), "step", json!({"n": n}));
        }
        // Oldest entries were evicted at the 512 cap
        assert!(p.memory.search("step", 1000).len() <= 512);
        assert_eq!(p.memory.search("599", 10).len(), 1);
        assert_eq!(p.memory.search("\"n\":0}", 10).len(), 0);
    }

    #[test]
    fn test_average_duration() {
        let metrics = PoolMetrics::default();
        metrics.record_completed(100);
        metrics.record_failed(300);
        assert_eq!(metrics.average_step_duration_ms(), 200);
    }
}

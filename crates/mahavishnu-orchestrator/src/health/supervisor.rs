//! Health supervisor
//!
//! Two external probes and one internal report. Liveness catches a wedged
//! scheduler, memory pressure, stuck workflows and broadly stale worker
//! heartbeats. Readiness gates on an initialized adapter, a writable
//! checkpoint store and at least one pool able to take work. The component
//! report aggregates per-component health; `degraded` is sticky for a short
//! cooldown so the flag does not flap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mahavishnu_core::config::HealthConfig;

use crate::adapter::AdapterRegistry;
use crate::persistence::CheckpointStore;
use crate::persistence::WorkflowStore;
use crate::pool::PoolManager;
use crate::reliability::{BreakerRegistry, CircuitState};
use crate::worker::WorkerManager;

/// Progress signal the engine beats at every step boundary
pub struct SchedulerPulse {
    /// Milliseconds since the epoch of the last observed progress
    last_beat_ms: AtomicU64,
}

impl SchedulerPulse {
    /// Create a pulse that starts fresh
    pub fn new() -> Self {
        Self {
            last_beat_ms: AtomicU64::new(Self::now_ms()),
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Record scheduler progress
    pub fn beat(&self) {
        self.last_beat_ms.store(Self::now_ms(), Ordering::Relaxed);
    }

    /// Time since the last beat
    pub fn age(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        Duration::from_millis(Self::now_ms().saturating_sub(last))
    }
}

impl Default for SchedulerPulse {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-component health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ComponentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One component's health and detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub health: ComponentHealth,
    pub detail: String,
}

/// Aggregated component report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub overall: ComponentHealth,
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Liveness probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessReport {
    pub alive: bool,
    pub reasons: Vec<String>,
}

/// Readiness probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub reasons: Vec<String>,
}

/// Aggregates liveness, readiness and component health
pub struct HealthSupervisor {
    config: HealthConfig,
    pulse: Arc<SchedulerPulse>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<BreakerRegistry>,
    pools: Arc<PoolManager>,
    workers: Arc<WorkerManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    workflows: Arc<dyn WorkflowStore>,
    heartbeat_timeout: Duration,
    degraded_flag: Arc<AtomicBool>,
    degraded_until: Mutex<Option<Instant>>,
}

impl HealthSupervisor {
    /// Create a supervisor over the shared components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HealthConfig,
        pulse: Arc<SchedulerPulse>,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<BreakerRegistry>,
        pools: Arc<PoolManager>,
        workers: Arc<WorkerManager>,
        checkpoints: Arc<dyn CheckpointStore>,
        workflows: Arc<dyn WorkflowStore>,
        heartbeat_timeout: Duration,
        degraded_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            pulse,
            adapters,
            breakers,
            pools,
            workers,
            checkpoints,
            workflows,
            heartbeat_timeout,
            degraded_flag,
            degraded_until: Mutex::new(None),
        }
    }

    /// Whether submissions should carry the degraded advisory flag
    pub fn is_degraded(&self) -> bool {
        self.degraded_flag.load(Ordering::Relaxed)
    }

    /// Liveness probe
    pub async fn liveness(&self) -> LivenessReport {
        let mut reasons = Vec::new();

        if self.pulse.age() > self.config.scheduler_progress_timeout {
            reasons.push(format!(
                "no scheduler progress for {:?}",
                self.pulse.age()
            ));
        }

        let memory_percent = memory_used_percent();
        if memory_percent > self.config.memory_threshold_percent as u64 {
            reasons.push(format!(
                "memory usage {memory_percent}% exceeds {}%",
                self.config.memory_threshold_percent
            ));
        }

        match self
            .workflows
            .count_running_older_than(self.config.stuck_workflow_age)
            .await
        {
            Ok(stuck) if stuck > self.config.stuck_workflow_threshold_count => {
                reasons.push(format!("{stuck} workflows stuck in running"));
            }
            Ok(_) => {}
            Err(err) => reasons.push(format!("workflow store unreachable: {err}")),
        }

        if let Some(age) = self.workers.oldest_heartbeat_age() {
            if age > self.heartbeat_timeout {
                reasons.push(format!("worker heartbeats stale by {age:?}"));
            }
        }

        if !reasons.is_empty() {
            warn!(?reasons, "liveness check failing");
        }
        LivenessReport {
            alive: reasons.is_empty(),
            reasons,
        }
    }

    /// Readiness probe
    pub async fn readiness(&self) -> ReadinessReport {
        let mut reasons = Vec::new();

        if self.adapters.initialized_count() == 0 {
            reasons.push("no adapter initialized".to_string());
        }
        if let Err(err) = self.checkpoints.probe_writable().await {
            reasons.push(format!("checkpoint store not writable: {err}"));
        }
        if self.pools.accepting_pool_count() == 0 {
            reasons.push("no eligible pool".to_string());
        }

        ReadinessReport {
            ready: reasons.is_empty(),
            reasons,
        }
    }

    /// Aggregated component report with sticky degraded state
    pub async fn components(&self) -> ComponentReport {
        let mut components = BTreeMap::new();

        // Adapters: unhealthy with none initialized, degraded with any
        // breaker open
        let initialized = self.adapters.initialized_count();
        let open_breakers = self
            .breakers
            .snapshot_all()
            .into_iter()
            .filter(|snapshot| snapshot.state == CircuitState::Open)
            .count();
        components.insert(
            "adapters".to_string(),
            if initialized == 0 {
                ComponentStatus {
                    health: ComponentHealth::Unhealthy,
                    detail: "no adapter initialized".into(),
                }
            } else if open_breakers > 0 {
                ComponentStatus {
                    health: ComponentHealth::Degraded,
                    detail: format!("{open_breakers} breaker(s) open"),
                }
            } else {
                ComponentStatus {
                    health: ComponentHealth::Healthy,
                    detail: format!("{initialized} adapter(s) initialized"),
                }
            },
        );

        // Pools
        let pool_count = self.pools.list().len();
        let accepting = self.pools.accepting_pool_count();
        components.insert(
            "pools".to_string(),
            if pool_count == 0 {
                ComponentStatus {
                    health: ComponentHealth::Unhealthy,
                    detail: "no pools".into(),
                }
            } else if accepting == 0 {
                ComponentStatus {
                    health: ComponentHealth::Degraded,
                    detail: "no pool accepting work".into(),
                }
            } else {
                ComponentStatus {
                    health: ComponentHealth::Healthy,
                    detail: format!("{accepting}/{pool_count} pools accepting"),
                }
            },
        );

        // Checkpoint store
        components.insert(
            "checkpoint_store".to_string(),
            match self.checkpoints.probe_writable().await {
                Ok(()) => ComponentStatus {
                    health: ComponentHealth::Healthy,
                    detail: "writable".into(),
                },
                Err(err) => ComponentStatus {
                    health: ComponentHealth::Unhealthy,
                    detail: err.to_string(),
                },
            },
        );

        // Scheduler
        components.insert(
            "scheduler".to_string(),
            if self.pulse.age() > self.config.scheduler_progress_timeout {
                ComponentStatus {
                    health: ComponentHealth::Unhealthy,
                    detail: format!("no progress for {:?}", self.pulse.age()),
                }
            } else {
                ComponentStatus {
                    health: ComponentHealth::Healthy,
                    detail: "making progress".into(),
                }
            },
        );

        let computed = components
            .values()
            .map(|status| status.health)
            .max()
            .unwrap_or(ComponentHealth::Healthy);

        let overall = self.apply_degraded_stickiness(computed);
        ComponentReport {
            overall,
            components,
        }
    }

    /// Degraded is sticky for the configured cooldown to avoid flapping
    fn apply_degraded_stickiness(&self, computed: ComponentHealth) -> ComponentHealth {
        let mut until = self.degraded_until.lock();
        let now = Instant::now();

        match computed {
            ComponentHealth::Degraded | ComponentHealth::Unhealthy => {
                *until = Some(now + self.config.degraded_cooldown);
                self.degraded_flag.store(true, Ordering::Relaxed);
                computed
            }
            ComponentHealth::Healthy => {
                if let Some(deadline) = *until {
                    if now < deadline {
                        debug!("holding degraded state through cooldown");
                        return ComponentHealth::Degraded;
                    }
                }
                *until = None;
                self.degraded_flag.store(false, Ordering::Relaxed);
                ComponentHealth::Healthy
            }
        }
    }

    /// Background maintenance pass: retry failed adapter startups, recycle
    /// stale workers, refresh the degraded flag
    pub async fn tick(&self) {
        self.adapters.retry_uninitialized().await;
        self.pools.reconcile().await;
        let _ = self.components().await;
    }
}

/// System memory usage in percent
fn memory_used_percent() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory().max(1);
    system.used_memory() * 100 / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, LocalAdapter};
    use crate::persistence::{InMemoryCheckpointStore, InMemoryWorkflowStore};
    use crate::pool::{PoolManagerConfig, PoolSpec};
    use crate::reliability::CircuitBreakerConfig;
    use crate::worker::WorkerManagerConfig;
    use mahavishnu_core::IdGenerator;

    struct Fixture {
        supervisor: HealthSupervisor,
        adapters: Arc<AdapterRegistry>,
        pools: Arc<PoolManager>,
    }

    fn fixture() -> Fixture {
        let ids = Arc::new(IdGenerator::new());
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
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
            workers.clone(),
            adapters.clone(),
            breakers.clone(),
        ));

        let supervisor = HealthSupervisor::new(
            HealthConfig {
                degraded_cooldown: Duration::from_millis(100),
                ..Default::default()
            },
            Arc::new(SchedulerPulse::new()),
            adapters.clone(),
            breakers,
            pools.clone(),
            workers,
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryWorkflowStore::new()),
            Duration::from_secs(300),
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            supervisor,
            adapters,
            pools,
        }
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
    async fn test_not_ready_without_adapter_or_pool() {
        let f = fixture();
        let report = f.supervisor.readiness().await;
        assert!(!report.ready);
        assert!(report.reasons.iter().any(|r| r.contains("adapter")));
        assert!(report.reasons.iter().any(|r| r.contains("pool")));
    }

    #[tokio::test]
    async fn test_ready_once_adapter_and_pool_exist() {
        let f = fixture();
        f.adapters.initialize_all().await;
        f.pools.spawn_pool(spec()).await.unwrap();

        let report = f.supervisor.readiness().await;
        assert!(report.ready, "reasons: {:?}", report.reasons);
    }

    #[tokio::test]
    async fn test_liveness_is_alive_by_default() {
        let f = fixture();
        let report = f.supervisor.liveness().await;
        assert!(report.alive, "reasons: {:?}", report.reasons);
    }

    #[tokio::test]
    async fn test_degraded_is_sticky_through_cooldown() {
        let f = fixture();
        f.adapters.initialize_all().await;
        f.pools.spawn_pool(spec()).await.unwrap();

        // Degrade: no pool accepting after drain
        let pool_id = f.pools.list()[0].id;
        f.pools.drain(pool_id).await.unwrap();
        let report = f.supervisor.components().await;
        assert_ne!(report.overall, ComponentHealth::Healthy);
        assert!(f.supervisor.is_degraded());

        // Recover immediately: still degraded inside the cooldown window
        f.pools.spawn_pool(spec()).await.unwrap();
        let report = f.supervisor.components().await;
        assert_eq!(report.overall, ComponentHealth::Degraded);

        // After the cooldown the healthy state lands
        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = f.supervisor.components().await;
        assert_eq!(report.overall, ComponentHealth::Healthy);
        assert!(!f.supervisor.is_degraded());
    }
}

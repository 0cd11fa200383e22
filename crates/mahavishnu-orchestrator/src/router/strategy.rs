//! Pool selection strategies

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use mahavishnu_core::PoolId;

use crate::pool::PoolSnapshot;

/// Strategy for picking a pool among the eligible set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default, utoipa::ToSchema)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Next pool in the ring; pools with an open breaker were already
    /// filtered out
    RoundRobin,

    /// Lowest (queued + in-flight) / max_workers, ties broken by lower
    /// average step duration
    #[default]
    LeastLoaded,

    /// Uniform over the eligible pools
    Random,

    /// Hash of a caller-supplied key, for affinity and cache locality
    Sticky { key: String },
}

impl RoutingStrategy {
    /// Pick a pool from a non-empty eligible set
    ///
    /// `ring` is the shared round-robin cursor. Returns `None` only when
    /// `eligible` is empty.
    pub fn select(&self, eligible: &[PoolSnapshot], ring: &AtomicUsize) -> Option<PoolId> {
        if eligible.is_empty() {
            return None;
        }

        let index = match self {
            Self::RoundRobin => ring.fetch_add(1, Ordering::Relaxed) % eligible.len(),
            Self::LeastLoaded => {
                return eligible
                    .iter()
                    .min_by_key(|pool| load_key(pool))
                    .map(|pool| pool.id);
            }
            Self::Random => rand::thread_rng().gen_range(0..eligible.len()),
            Self::Sticky { key } => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() as usize) % eligible.len()
            }
        };
        Some(eligible[index].id)
    }
}

/// Load per unit of capacity in per-mille, tie-broken by average duration
fn load_key(pool: &PoolSnapshot) -> (u64, u64) {
    let load = (pool.metrics.queued_tasks + pool.metrics.in_flight_tasks) as u64;
    let capacity = pool.max_workers.max(1) as u64;
    (load * 1000 / capacity, pool.metrics.average_step_duration_ms)
}

//! Worker pools
//!
//! A pool is the ownership boundary for a homogeneous fleet of workers
//! bound to one adapter. Pools scale between min and max, report metrics,
//! and drain before closing.

mod manager;
#[allow(clippy::module_inception)]
mod pool;

pub use manager::{PoolManager, PoolManagerConfig, PoolSpec};
pub use pool::{MemoryHit, Pool, PoolMetricsSnapshot, PoolSnapshot, PoolState};

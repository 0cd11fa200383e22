//! Backpressure management for pools
//!
//! Load-aware task acceptance with hysteresis: a pool stops taking work at
//! the high watermark and resumes below the low watermark, which prevents
//! accept/reject oscillation right at the boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use mahavishnu_core::{Error, Result};

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use mahavishnu_orchestrator::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting when load exceeds this ratio of capacity
    pub high_watermark: f64,

    /// Resume accepting when load drops below this ratio
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    /// Create a new backpressure configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the high watermark
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Validate watermark ordering
    pub fn validate(&self) -> Result<()> {
        if self.low_watermark >= self.high_watermark {
            return Err(Error::invalid(
                "low_watermark must be less than high_watermark",
            ));
        }
        Ok(())
    }
}

/// Load tracking with watermark hysteresis
///
/// Lock-free; counters are updated on task start/completion and read by the
/// router's eligibility filter.
pub struct BackpressureState {
    config: BackpressureConfig,
    capacity: AtomicUsize,
    current_load: AtomicUsize,
    accepting: AtomicBool,
}

impl BackpressureState {
    /// Create state for the given capacity
    pub fn new(config: BackpressureConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: AtomicUsize::new(capacity.max(1)),
            current_load: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    /// Update the capacity after a scale operation
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    /// Whether new work should be accepted right now
    pub fn should_accept(&self) -> bool {
        let accepting = self.accepting.load(Ordering::Relaxed);
        let load = self.current_load.load(Ordering::Relaxed) as f64;
        let ratio = load / self.capacity.load(Ordering::Relaxed).max(1) as f64;

        if accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                return true;
            }
            false
        }
    }

    /// Record a task entering execution
    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task leaving execution
    pub fn task_completed(&self) {
        let previous = self.current_load.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "load underflow");
    }

    /// Current in-flight count
    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    /// Free capacity estimate
    pub fn headroom(&self) -> usize {
        let capacity = self.capacity.load(Ordering::Relaxed);
        capacity.saturating_sub(self.current_load.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let config = BackpressureConfig::default()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hysteresis() {
        let state = BackpressureState::new(
            BackpressureConfig::default()
                .with_high_watermark(0.8)
                .with_low_watermark(0.5),
            10,
        );

        for _ in 0..8 {
            state.task_started();
        }
        // At the high watermark: stop accepting
        assert!(!state.should_accept());

        // Dropping just below high is not enough to resume
        state.task_completed();
        assert!(!state.should_accept());

        // Below the low watermark: resume
        for _ in 0..3 {
            state.task_completed();
        }
        assert!(state.should_accept());
    }

    #[test]
    fn test_headroom() {
        let state = BackpressureState::new(BackpressureConfig::default(), 4);
        assert_eq!(state.headroom(), 4);
        state.task_started();
        state.task_started();
        assert_eq!(state.headroom(), 2);
    }
}

//! Circuit breaker
//!
//! One breaker per named dependency (adapter, external service, worker
//! type). Calls acquire a [`Permit`] and report the outcome through it;
//! while the breaker is open, calls fail fast with `DependencyDown` without
//! contacting the dependency.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  failures ≥ threshold  ┌─────────┐     cooldown      ┌──────────┐
//! │ Closed  │ ─────────────────────► │  Open   │ ────────────────► │ HalfOpen │
//! └─────────┘                        └─────────┘                   └──────────┘
//!      ▲                                  ▲     probe failed           │
//!      │        probe successes           │    (cooldown doubles)      │
//!      └──────────────────────────────────┴────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mahavishnu_core::config::BreakerSettings;
use mahavishnu_core::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass, failures are counted
    Closed,

    /// Failure threshold exceeded - calls fail fast
    Open,

    /// Cooldown elapsed - a single probe call is admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use mahavishnu_orchestrator::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_cooldown(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window required to open
    pub failure_threshold: u32,

    /// Consecutive failures that open regardless of the window
    pub consecutive_threshold: u32,

    /// Rolling window for failure counting
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Time spent open before admitting a probe
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Cap for the doubling cooldown
    #[serde(with = "duration_millis")]
    pub max_cooldown: Duration,

    /// Consecutive probe successes required to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            consecutive_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            success_threshold: 1,
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.threshold,
            consecutive_threshold: settings.consecutive_threshold,
            window: settings.window,
            cooldown: settings.cooldown,
            max_cooldown: settings.max_cooldown,
            success_threshold: settings.success_threshold,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rolling-window failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the consecutive failure threshold
    pub fn with_consecutive_threshold(mut self, threshold: u32) -> Self {
        self.consecutive_threshold = threshold.max(1);
        self
    }

    /// Set the rolling window size
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the open-state cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the cooldown cap
    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    /// Set the probe successes required to close
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

/// Queryable breaker state for metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub current_cooldown: Duration,
}

struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps inside the rolling window
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    current_cooldown: Duration,
    /// Half-open admits exactly one in-flight probe
    probe_in_flight: bool,
}

/// Circuit breaker for one named dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new breaker in the closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                opened_at_wall: None,
                current_cooldown,
                probe_in_flight: false,
            }),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to acquire a permit for one call
    ///
    /// Returns `DependencyDown` without contacting the dependency while the
    /// breaker is open, and while a half-open probe is already in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= inner.current_cooldown {
                    debug!(breaker = %self.name, "cooldown elapsed, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.open_error(inner.current_cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(inner.current_cooldown))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    /// Current state without acquiring a permit
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Queryable snapshot for metrics
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        let window = self.config.window;
        prune_window(&mut inner.failures, window);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
            current_cooldown: inner.current_cooldown,
        }
    }

    /// Trip the breaker open immediately (startup failures)
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "breaker tripped open");
        Self::open_locked(&mut inner);
    }

    /// Reset to closed with fresh counters (admin operation)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::close_locked(&mut inner, self.config.cooldown);
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::dependency_down(format!("circuit breaker '{}' is open", self.name))
            .with_context("breaker", &self.name)
            .with_retry_after(retry_after)
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;

        if probe {
            inner.probe_in_flight = false;
        }

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                debug!(breaker = %self.name, "probe succeeded, closing");
                Self::close_locked(&mut inner, self.config.cooldown);
            }
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();

        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                inner.failures.push_back(now);
                prune_window(&mut inner.failures, self.config.window);
                inner.consecutive_failures += 1;

                if inner.failures.len() as u32 >= self.config.failure_threshold
                    || inner.consecutive_failures >= self.config.consecutive_threshold
                {
                    warn!(
                        breaker = %self.name,
                        windowed = inner.failures.len(),
                        consecutive = inner.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    Self::open_locked(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: reopen with a doubled cooldown, capped
                let doubled = inner.current_cooldown * 2;
                inner.current_cooldown = doubled.min(self.config.max_cooldown);
                warn!(
                    breaker = %self.name,
                    cooldown_ms = inner.current_cooldown.as_millis() as u64,
                    "probe failed, reopening"
                );
                Self::open_locked(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
    }

    fn open_locked(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
    }

    fn close_locked(inner: &mut BreakerInner, base_cooldown: Duration) {
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.current_cooldown = base_cooldown;
        inner.probe_in_flight = false;
    }
}

fn prune_window(failures: &mut VecDeque<Instant>, window: Duration) {
    let Some(cutoff) = Instant::now().checked_sub(window) else {
        return;
    };
    while failures.front().is_some_and(|t| *t < cutoff) {
        failures.pop_front();
    }
}

/// Permit held for the duration of one protected call
///
/// Dropping a half-open permit without reporting releases the probe slot
/// without counting an outcome.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.probe);
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

/// Registry of breakers, one per named dependency
#[derive(Default)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry applying the given defaults to new breakers
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for a dependency
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Look up an existing breaker without creating one
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    /// Snapshot every breaker for metrics
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.snapshot())
            .collect()
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
    use mahavishnu_core::ErrorKind;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test_service",
            CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_consecutive_threshold(3)
                .with_cooldown(Duration::from_millis(50))
                .with_max_cooldown(Duration::from_millis(400)),
        )
    }

    #[test]
    fn test_starts_closed() {
        assert_eq!(breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = breaker();
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().success();
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().failure();
        // Never 3 in a row and only 4 in the window
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_fails_fast_with_dependency_down() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyDown);
        assert!(err.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_closes_on_success() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let permit = b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        permit.success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let _probe = b.try_acquire().unwrap();
        let second = b.try_acquire();
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_probe_failure_doubles_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        b.try_acquire().unwrap().failure();

        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().current_cooldown, Duration::from_millis(100));

        // Cap applies after repeated probe failures
        for _ in 0..4 {
            tokio::time::sleep(b.snapshot().current_cooldown + Duration::from_millis(20)).await;
            b.try_acquire().unwrap().failure();
        }
        assert_eq!(b.snapshot().current_cooldown, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_close_resets_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        b.try_acquire().unwrap().failure();
        tokio::time::sleep(Duration::from_millis(120)).await;
        b.try_acquire().unwrap().success();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().current_cooldown, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_abandoned_probe_releases_slot() {
        let b = breaker();
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        drop(b.try_acquire().unwrap());
        // Slot released: another probe is admitted
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn test_success_threshold_requires_consecutive_probes() {
        let b = CircuitBreaker::new(
            "two_probes",
            CircuitBreakerConfig::default()
                .with_consecutive_threshold(1)
                .with_cooldown(Duration::ZERO)
                .with_success_threshold(2),
        );
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Open);

        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trip_and_reset() {
        let b = breaker();
        b.trip();
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.breaker("adapter.local");
        let b = registry.breaker("adapter.local");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshot_all().len(), 1);
    }
}

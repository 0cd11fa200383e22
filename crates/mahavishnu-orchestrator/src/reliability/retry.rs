//! Retry policy
//!
//! Exponential backoff with full jitter. Only retryable error kinds are
//! retried, and the total wall-clock time across attempts never exceeds the
//! task's remaining deadline; on violation the loop surfaces `Timeout`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mahavishnu_core::config::RetrySettings;
use mahavishnu_core::{Error, ErrorKind, Result};

/// Retry configuration for one step
///
/// # Example
///
/// ```
/// use mahavishnu_orchestrator::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_millis(100));
///
/// // First retry after ~100ms, second after ~200ms, third after ~400ms...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    #[schema(value_type = u64)]
    pub base_delay: Duration,

    /// Cap for computed delays
    #[serde(with = "duration_millis")]
    #[schema(value_type = u64)]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Computed delay before retrying after `attempt` (1-based), pre-jitter
    pub fn computed_delay(&self, attempt: u32) -> Duration {
        if attempt < 1 {
            return Duration::ZERO;
        }
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }

    /// Delay with full jitter: uniform in `[0, computed_delay]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let computed = self.computed_delay(attempt);
        if computed.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(0.0..=computed.as_secs_f64()))
    }

    /// Whether another attempt remains after `attempts_made`
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Drive an operation under a retry policy, a hard deadline and a
/// cancellation token
///
/// The operation is handed the 1-based attempt number. Terminal errors and
/// `Cancelled` return immediately; retryable errors back off and retry while
/// attempts and deadline budget remain. A backoff that would overrun the
/// deadline surfaces `Timeout` instead of sleeping through it. The backoff
/// sleep is a suspension point: cancellation arriving mid-backoff interrupts
/// it and surfaces `Cancelled` without waiting for the next attempt.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("cancelled before attempt")
                .with_context("attempt", attempt));
        }
        if Instant::now() >= deadline {
            return Err(Error::timeout("deadline elapsed before attempt")
                .with_context("attempt", attempt));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind == ErrorKind::Cancelled => return Err(err),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if !policy.has_attempts_remaining(attempt) {
                    return Err(err);
                }

                let delay = policy.jittered_delay(attempt);
                let now = Instant::now();
                if now + delay >= deadline {
                    return Err(Error::timeout("retry budget exceeds task deadline")
                        .with_context("attempt", attempt)
                        .with_context("delay_ms", delay.as_millis())
                        .with_source(err));
                }

                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::cancelled("cancelled during retry backoff")
                            .with_context("attempt", attempt)
                            .with_source(err));
                    }
                }
                attempt += 1;
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_computed_delay_grows_exponentially() {
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(60));

        assert_eq!(policy.computed_delay(1), Duration::from_millis(100));
        assert_eq!(policy.computed_delay(2), Duration::from_millis(200));
        assert_eq!(policy.computed_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_caps_backoff() {
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.computed_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_computed_delay() {
        let policy = RetryPolicy::exponential().with_base_delay(Duration::from_millis(50));
        for attempt in 1..6 {
            let jittered = policy.jittered_delay(attempt);
            assert!(jittered <= policy.computed_delay(attempt));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = run_with_retry(
            &policy,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::dependency_down("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let policy = RetryPolicy::exponential().with_max_attempts(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = run_with_retry(
            &policy,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::invalid("bad input"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Invalid);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_is_never_retried() {
        let policy = RetryPolicy::exponential().with_max_attempts(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = run_with_retry(
            &policy,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::cancelled("caller went away"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = run_with_retry(
            &policy,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::dependency_down("still down"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::DependencyDown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_never_overruns_deadline() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_base_delay(Duration::from_secs(10));

        let started = Instant::now();
        let result: Result<()> = run_with_retry(
            &policy,
            started + Duration::from_millis(50),
            &CancellationToken::new(),
            |_attempt| async { Err(Error::dependency_down("down")) },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        // Surfaced Timeout instead of sleeping through a 10s backoff
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_secs(10))
            .with_multiplier(1.0);
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = run_with_retry(
            &policy,
            started + Duration::from_secs(60),
            &cancel,
            |_attempt| async { Err(Error::dependency_down("down")) },
        )
        .await;

        // Interrupted mid-backoff, long before the 10s sleep finishes
        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_attempts() {
        let policy = RetryPolicy::exponential();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = run_with_retry(
            &policy,
            Instant::now() + Duration::from_secs(5),
            &cancel,
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

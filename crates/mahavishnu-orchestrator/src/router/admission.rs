//! Admission control
//!
//! One global gate bounds concurrent workflows; a per-key token bucket
//! bounds tenant submission rate. Both are checked before routing, so a
//! rejected task never reaches a pool. Long-running tasks in flight are
//! never preempted by admission decisions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use mahavishnu_core::{Error, Result};

/// Admission configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Global cap on concurrently running workflows
    pub max_concurrent_workflows: usize,

    /// Bounded wait for a global slot before failing `Exhausted`
    #[serde(with = "duration_millis")]
    pub admission_wait: Duration,

    /// Tenant bucket refill rate in tokens per second
    pub tenant_rate_per_second: f64,

    /// Tenant bucket burst capacity
    pub tenant_burst: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            admission_wait: Duration::from_secs(2),
            tenant_rate_per_second: 10.0,
            tenant_burst: 20,
        }
    }
}

/// Token bucket for one tenant key
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token is available
    fn time_to_token(&self) -> Duration {
        if self.tokens >= 1.0 || self.refill_per_second <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_second)
        }
    }
}

/// Permit representing one admitted workflow slot
///
/// Dropping the permit releases the slot; the engine holds it for the
/// workflow's lifetime.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Global admission gate plus per-tenant rate limiting
pub struct AdmissionController {
    config: AdmissionConfig,
    slots: Arc<Semaphore>,
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl AdmissionController {
    /// Create a controller with the given limits
    pub fn new(config: AdmissionConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_workflows));
        Self {
            config,
            slots,
            buckets: DashMap::new(),
        }
    }

    /// Admit one submission
    ///
    /// The tenant rate check fails fast; the global gate waits up to
    /// `admission_wait` for a slot, then fails with `Exhausted` carrying a
    /// retry-after hint.
    pub async fn acquire(&self, tenant: Option<&str>) -> Result<AdmissionPermit> {
        if let Some(tenant) = tenant {
            let bucket = self.buckets.entry(tenant.to_string()).or_insert_with(|| {
                Mutex::new(TokenBucket::new(
                    self.config.tenant_burst as f64,
                    self.config.tenant_rate_per_second,
                ))
            });
            let mut bucket = bucket.lock();
            if !bucket.try_take() {
                let retry_after = bucket.time_to_token();
                return Err(Error::exhausted("tenant rate limit exceeded")
                    .with_context("tenant", tenant)
                    .with_retry_after(retry_after));
            }
        }

        let permit = tokio::time::timeout(
            self.config.admission_wait,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::exhausted("concurrent workflow limit reached")
                .with_context("limit", self.config.max_concurrent_workflows)
                .with_retry_after(self.config.admission_wait)
        })?
        .map_err(|_| Error::internal("admission gate closed"))?;

        Ok(AdmissionPermit { _permit: permit })
    }

    /// Workflows currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_workflows - self.slots.available_permits()
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.slots.available_permits()
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

    #[tokio::test]
    async fn test_acquires_up_to_limit() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: 2,
            admission_wait: Duration::from_millis(50),
            ..Default::default()
        });

        let _a = controller.acquire(None).await.unwrap();
        let _b = controller.acquire(None).await.unwrap();
        assert_eq!(controller.in_flight(), 2);

        let err = controller.acquire(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);
        assert!(err.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_dropping_permit_releases_slot() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: 1,
            admission_wait: Duration::from_millis(50),
            ..Default::default()
        });

        let permit = controller.acquire(None).await.unwrap();
        drop(permit);
        assert!(controller.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_waits_for_slot_within_admission_wait() {
        let controller = Arc::new(AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: 1,
            admission_wait: Duration::from_millis(500),
            ..Default::default()
        }));

        let permit = controller.acquire(None).await.unwrap();
        let controller_clone = Arc::clone(&controller);
        let waiter =
            tokio::spawn(async move { controller_clone.acquire(None).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tenant_bucket_fails_fast() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: 100,
            tenant_rate_per_second: 0.0,
            tenant_burst: 2,
            ..Default::default()
        });

        assert!(controller.acquire(Some("acme")).await.is_ok());
        assert!(controller.acquire(Some("acme")).await.is_ok());
        let err = controller.acquire(Some("acme")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exhausted);

        // Other tenants are unaffected
        assert!(controller.acquire(Some("globex")).await.is_ok());
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_concurrent_workflows: 100,
            tenant_rate_per_second: 50.0,
            tenant_burst: 1,
            ..Default::default()
        });

        assert!(controller.acquire(Some("acme")).await.is_ok());
        assert!(controller.acquire(Some("acme")).await.is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(controller.acquire(Some("acme")).await.is_ok());
    }
}

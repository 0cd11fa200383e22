//! Resilience primitives
//!
//! Circuit breakers gate persistently failing dependencies; retry policies
//! drive exponential backoff with jitter inside the task deadline.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit,
};
pub use retry::{run_with_retry, RetryPolicy};

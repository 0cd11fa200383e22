//! Error taxonomy used by every component
//!
//! Every failure carries a tagged kind, a stable numeric code, a human
//! message, a structured context map and an optional wrapped cause. Errors
//! classify themselves as retryable or terminal; only retryable errors feed
//! the retry machinery.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::CorrelationId;

/// Result alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tagged error kinds
///
/// `Cancelled` and `Timeout` are never retried by the immediate caller, but
/// the caller of the caller may retry the enclosing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown workflow, pool, worker or adapter
    NotFound,
    /// Schema, range or size violation
    Invalid,
    /// Caller is not allowed to perform the operation
    Unauthorized,
    /// Concurrent scale, stale checkpoint version, idempotency key mismatch
    Conflict,
    /// Admission rejected, worker cap hit, no eligible pool
    Exhausted,
    /// Deadline elapsed
    Timeout,
    /// Operation was cancelled
    Cancelled,
    /// Adapter or upstream dependency unavailable (breaker open)
    DependencyDown,
    /// Unexpected internal failure
    Internal,
}

impl ErrorKind {
    /// Stable numeric code surfaced to callers
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound => 1001,
            Self::Invalid => 1002,
            Self::Unauthorized => 1003,
            Self::Conflict => 1004,
            Self::Exhausted => 1005,
            Self::Timeout => 1006,
            Self::Cancelled => 1007,
            Self::DependencyDown => 1008,
            Self::Internal => 1009,
        }
    }

    /// Whether errors of this kind may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::Exhausted | Self::Timeout | Self::DependencyDown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Invalid => "invalid",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Exhausted => "exhausted",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::DependencyDown => "dependency_down",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Orchestrator error
#[derive(Debug, thiserror::Error)]
#[error("{} ({}): {}{}", .kind, .kind.code(), .message, render_context(.context))]
pub struct Error {
    /// Tagged kind
    pub kind: ErrorKind,
    /// Human message
    pub message: String,
    /// Structured context (entity ids, limits, observed values)
    pub context: BTreeMap<String, String>,
    /// Correlation id for log and audit lookup
    pub correlation_id: Option<CorrelationId>,
    /// Suggested retry-after for retryable kinds
    pub retry_after: Option<Duration>,
    /// Wrapped cause
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn render_context(context: &BTreeMap<String, String>) -> String {
    if context.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = context.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" [{}]", pairs.join(", "))
}

impl Error {
    /// Create a new error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            correlation_id: None,
            retry_after: None,
            source: None,
        }
    }

    /// Attach a context key/value pair
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Attach a suggested retry-after hint
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// Attach a wrapped cause
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Stable numeric code
    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    /// Whether this error may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    // Shorthand constructors, one per kind.

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn dependency_down(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DependencyDown, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(format!("serialization failed: {err}")).with_source(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("io error: {err}")).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::NotFound.code(), 1001);
        assert_eq!(ErrorKind::Internal.code(), 1009);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::Exhausted.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::DependencyDown.is_retryable());
        assert!(ErrorKind::Conflict.is_retryable());

        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Invalid.is_retryable());
        assert!(!ErrorKind::Unauthorized.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn test_display_includes_code_and_context() {
        let err = Error::exhausted("worker cap reached")
            .with_context("pool_id", "p-1")
            .with_context("cap", 8);
        let rendered = err.to_string();
        assert!(rendered.contains("1005"));
        assert!(rendered.contains("pool_id=p-1"));
        assert!(rendered.contains("cap=8"));
    }

    #[test]
    fn test_wrapped_cause_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::internal("checkpoint write failed").with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::exhausted("admission rejected")
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }
}

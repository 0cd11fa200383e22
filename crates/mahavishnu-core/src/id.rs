//! Time-ordered identifiers
//!
//! All entities are identified by ULIDs: 26-character Crockford base32
//! tokens that sort lexicographically by creation time. Ids minted through
//! [`IdGenerator`] are strictly monotonic within a process, even when two
//! ids fall into the same millisecond.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use utoipa::ToSchema;

/// Process-wide monotonic ULID source
///
/// Wraps [`ulid::Generator`] behind a mutex so that concurrent callers
/// observe strictly increasing ids. A fresh generator is cheap; components
/// share one through their runtime context rather than a global.
pub struct IdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl IdGenerator {
    /// Create a new generator
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }

    /// Mint the next ULID
    ///
    /// If the random component overflows within a single millisecond (an
    /// astronomically unlikely event), falls back to a fresh timestamp.
    pub fn next(&self) -> Ulid {
        let mut gen = self.inner.lock();
        gen.generate().unwrap_or_else(|_| Ulid::new())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Mint a new id from the given generator
            pub fn generate(ids: &IdGenerator) -> Self {
                Self(ids.next())
            }

            /// Wrap an existing ULID
            pub fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Underlying ULID value
            pub fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Ulid::from_string(s)?))
            }
        }
    };
}

id_type! {
    /// Identifies a submitted task
    TaskId
}

id_type! {
    /// Identifies a workflow execution
    WorkflowId
}

id_type! {
    /// Identifies a worker pool
    PoolId
}

id_type! {
    /// Identifies a single worker within a pool
    WorkerId
}

id_type! {
    /// Correlates log lines, audit events and surfaced errors for one request
    CorrelationId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGenerator::new();
        let mut previous = ids.next();
        // Enough iterations to land many ids in the same millisecond
        for _ in 0..10_000 {
            let next = ids.next();
            assert!(next > previous, "{next} must sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_display_is_26_chars() {
        let ids = IdGenerator::new();
        let id = WorkflowId::generate(&ids);
        assert_eq!(id.to_string().len(), 26);
    }

    #[test]
    fn test_roundtrip_from_str() {
        let ids = IdGenerator::new();
        let id = TaskId::generate(&ids);
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_lexicographic_matches_ulid_order() {
        let ids = IdGenerator::new();
        let a = ids.next();
        let b = ids.next();
        assert!(b.to_string() > a.to_string());
    }

    #[test]
    fn test_invalid_string_rejected() {
        assert!("not-a-ulid".parse::<WorkerId>().is_err());
    }
}

//! Type-safe identifiers for calls, subscriptions and listeners.
//!
//! All three draw from one process-wide monotonic counter, so an id is
//! never reused for the lifetime of the process, not even across kinds.
//! On the wire, ids travel as decimal strings.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

// ============================================================================
// Counter
// ============================================================================

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[inline]
fn next_raw() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Id Types
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next unused id.
            #[inline]
            #[must_use]
            pub fn next() -> Self {
                Self(next_raw())
            }

            /// Parses an id received on the wire.
            ///
            /// Returns `None` for anything that was not produced by this
            /// process (non-numeric strings).
            #[inline]
            #[must_use]
            pub fn parse(raw: &str) -> Option<Self> {
                raw.parse().ok().map(Self)
            }

            /// Returns the raw counter value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}

define_id!(
    /// Identifier of a remote method call.
    CallId
);

define_id!(
    /// Identifier of a subscription.
    SubscriptionId
);

define_id!(
    /// Identifier of an event listener registered on the session bus.
    ListenerId
);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_across_kinds() {
        let a = CallId::next();
        let b = SubscriptionId::next();
        let c = CallId::next();
        assert!(b.as_u64() > a.as_u64());
        assert!(c.as_u64() > b.as_u64());
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = CallId::next();
        assert_eq!(CallId::parse(&id.to_string()), Some(id));
        assert_eq!(CallId::parse("not-a-number"), None);
    }

    #[test]
    fn test_serializes_as_string() {
        let id: SubscriptionId = "42".parse().expect("numeric id");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"42\"");
    }
}

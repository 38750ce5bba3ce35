//! DDP session engine.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionStatus`] | Observable connection state |
//! | [`CallOptions`] | Per-call queueing and retry flags |
//! | [`SubscribeOptions`] | Ready/stop hooks of a subscription |
//! | [`Collections`] | Immutable snapshot of mirrored documents |
//! | [`Transforms`] | Which collections are mirrored, and how |
//! | [`SessionEvent`] | Lifecycle and data events |
//!
//! The state machine itself is internal; it is driven by
//! [`Client`](crate::Client).

// ============================================================================
// Submodules
// ============================================================================

/// Pending method calls.
pub mod call;

/// Immutable collection snapshots.
pub mod collections;

/// Protocol state machine.
pub(crate) mod engine;

/// Session events and the listener registry.
pub mod events;

/// Pending subscriptions.
pub mod subscription;

// ============================================================================
// Re-exports
// ============================================================================

pub use call::{CallCallback, CallOptions, ResultHook};
pub use collections::{Collection, Collections, Document, Transform, Transforms};
pub use engine::ConnectionStatus;
pub use events::{EventKind, Listener, SessionEvent};
pub use subscription::{ReadyHook, StopHook, SubscribeOptions};

pub(crate) use engine::{Effect, Session};
pub(crate) use events::EventBus;

// ============================================================================
// Validation
// ============================================================================

use crate::error::{Error, Result};

/// Rejects empty method and publication names.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation(format!("{what} name must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("method", "todos.insert").is_ok());
        assert!(validate_name("method", "").is_err());
        assert!(validate_name("publication", "  ").is_err());
    }
}

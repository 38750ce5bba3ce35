//! Session configuration.
//!
//! Plain data consumed by the engine and the login routines. Built and
//! validated by [`ClientBuilder`](crate::ClientBuilder).

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Delay before reopening a dropped connection.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Suffix of the storage key holding the login token.
const TOKEN_KEY_SUFFIX: &str = "__login_token__";

// ============================================================================
// LogoutFailure
// ============================================================================

/// What to do with the local session when the `logout` call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogoutFailure {
    /// Clear the local session and stored token anyway.
    #[default]
    ForceLogout,
    /// Leave the local session untouched.
    KeepSession,
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Runtime settings of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Server endpoint, used for the transport and the token key.
    pub endpoint: String,

    /// Open the transport as soon as the client is built.
    pub auto_connect: bool,

    /// Reopen the transport after it drops.
    pub auto_reconnect: bool,

    /// Delay before reopening.
    pub reconnect_interval: Duration,

    /// Log every raw frame at `debug` level.
    pub debug: bool,

    /// Local session handling when `logout` fails.
    pub logout_failure: LogoutFailure,
}

impl SessionConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auto_connect: true,
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            debug: false,
            logout_failure: LogoutFailure::default(),
        }
    }

    /// Storage key of the persisted login token for this endpoint.
    #[inline]
    #[must_use]
    pub fn token_key(&self) -> String {
        format!("{}{TOKEN_KEY_SUFFIX}", self.endpoint)
    }
}

// ============================================================================
// Tests
// ============================================================================

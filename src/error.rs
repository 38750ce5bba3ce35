//! Error types for the DDP session client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ddp_session::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let value = client.call("todos.insert", vec![]).await?;
//!     println!("{value}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Validation`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Server`], [`Error::Canceled`] |
//! | Collaborators | [`Error::Storage`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Constants
// ============================================================================

/// Reason attached to cancellations that carry no explicit reason.
const DEFAULT_CANCEL_REASON: &str = "DDP canceled";

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. Errors are cheap
/// to clone so one failure can both reach an event listener and be returned.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned by [`ClientBuilder::build`](crate::ClientBuilder::build)
    /// when the client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Caller-supplied parameters rejected before dispatch.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport failure.
    ///
    /// Only ever surfaced through the `error` event, never thrown at callers.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The session engine is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Error reported by the server (`error`, `nosub`, or `result` with error).
    #[error("Server error [{code}]: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Server {
        /// Error code sent by the server.
        code: String,
        /// Human readable reason.
        reason: Option<String>,
        /// Structured details, if any.
        details: Option<Value>,
    },

    /// A call or subscription was terminated locally before completion.
    #[error("Canceled: {reason}")]
    Canceled {
        /// Why it was canceled.
        reason: String,
    },

    // ========================================================================
    // Collaborator Errors
    // ========================================================================
    /// Credential storage failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<WsError>),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Self::WebSocket(Arc::new(err))
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a server error.
    #[inline]
    pub fn server(
        code: impl Into<String>,
        reason: Option<String>,
        details: Option<Value>,
    ) -> Self {
        Self::Server {
            code: code.into(),
            reason,
            details,
        }
    }

    /// Creates a cancellation error with the default reason.
    #[inline]
    pub fn canceled() -> Self {
        Self::canceled_with(DEFAULT_CANCEL_REASON)
    }

    /// Creates a cancellation error with a specific reason.
    #[inline]
    pub fn canceled_with(reason: impl Into<String>) -> Self {
        Self::Canceled {
            reason: reason.into(),
        }
    }

    /// Creates a storage error.
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a local cancellation.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns `true` if the server reported this error.
    #[inline]
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// Returns the server error code, if this is a server error.
    #[inline]
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Client to server frames.
//!
//! Every frame the session engine writes to the transport is a
//! [`ClientMessage`], serialized to a JSON text frame.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{CallId, SubscriptionId};

use super::DDP_VERSION;

// ============================================================================
// ClientMessage
// ============================================================================

/// A frame sent from the client to the server.
///
/// # Format
///
/// ```json
/// { "msg": "method", "id": "7", "method": "todos.insert", "params": [...] }
/// { "msg": "sub", "id": "8", "name": "todos", "params": [] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Handshake, sent as soon as the transport opens.
    Connect {
        /// Proposed protocol version.
        version: String,
        /// Versions this client supports, in order of preference.
        support: Vec<String>,
    },

    /// Reply to a server `ping`.
    Pong {
        /// Echo of the ping id, if the ping carried one.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Remote method invocation.
    Method {
        /// Call identifier, echoed back in `result` and `updated`.
        id: CallId,
        /// Method name.
        method: String,
        /// Positional arguments.
        params: Vec<Value>,
    },

    /// Subscription request.
    Sub {
        /// Subscription identifier, echoed back in `ready` and `nosub`.
        id: SubscriptionId,
        /// Publication name.
        name: String,
        /// Publication arguments.
        params: Vec<Value>,
    },

    /// Subscription teardown.
    Unsub {
        /// Subscription to stop.
        id: SubscriptionId,
    },
}

impl ClientMessage {
    /// Creates the `connect` handshake frame.
    #[inline]
    #[must_use]
    pub fn connect() -> Self {
        Self::Connect {
            version: DDP_VERSION.to_string(),
            support: vec![DDP_VERSION.to_string()],
        }
    }

    /// Returns the wire name of this frame.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Pong { .. } => "pong",
            Self::Method { .. } => "method",
            Self::Sub { .. } => "sub",
            Self::Unsub { .. } => "unsub",
        }
    }

    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if a parameter value
    /// cannot be serialized.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

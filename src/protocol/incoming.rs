//! Server to client frames.
//!
//! Inbound text is decoded into [`ServerMessage`]. Frames whose `msg` tag
//! is unknown (or that carry no tag at all, like the legacy `server_id`
//! greeting) fail to decode and are dropped by the session engine, which
//! keeps the client forward compatible.
//!
//! # Frame Types
//!
//! | Group | Frames |
//! |-------|--------|
//! | Connection | `connected`, `ping`, `error` |
//! | Methods | `result`, `updated` |
//! | Subscriptions | `ready`, `nosub` |
//! | Data | `added`, `changed`, `removed` |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;

// ============================================================================
// ServerMessage
// ============================================================================

/// A frame sent from the server to the client.
///
/// Ids are kept as raw strings here; the engine resolves them against its
/// own registries and ignores ids it never issued.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected {
        /// Server-assigned session id.
        #[serde(default)]
        session: Option<String>,
    },

    /// Keep-alive probe; must be answered with `pong`.
    Ping {
        /// Optional id to echo back.
        #[serde(default)]
        id: Option<String>,
    },

    /// Initial data for these subscriptions has been sent.
    Ready {
        /// Subscription ids.
        #[serde(default)]
        subs: Vec<String>,
    },

    /// Subscription terminated by the server.
    Nosub {
        /// Subscription id.
        id: String,
        /// Why, if the server refused or failed the subscription.
        #[serde(default)]
        error: Option<ServerError>,
    },

    /// Outcome of a method call.
    Result {
        /// Call id.
        id: String,
        /// Failure, if the method threw.
        #[serde(default)]
        error: Option<ServerError>,
        /// Return value, if any.
        #[serde(default)]
        result: Option<Value>,
    },

    /// All writes of these methods are reflected in the data stream.
    Updated {
        /// Call ids.
        #[serde(default)]
        methods: Vec<String>,
    },

    /// The server could not process a client frame.
    Error {
        /// Human readable reason.
        #[serde(default)]
        reason: Option<String>,
        /// The frame that was rejected, if the server echoed it.
        #[serde(default, rename = "offendingMessage")]
        offending_message: Option<Value>,
    },

    /// Document added to a collection.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Document fields.
        #[serde(default)]
        fields: Map<String, Value>,
    },

    /// Document fields changed.
    Changed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Fields with new values.
        #[serde(default)]
        fields: Map<String, Value>,
        /// Fields to delete.
        #[serde(default)]
        cleared: Vec<String>,
    },

    /// Document removed from a collection.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
}

impl ServerMessage {
    /// Decodes a text frame.
    ///
    /// Returns `None` for anything that is not a known DDP frame.
    #[must_use]
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ============================================================================
// ServerError
// ============================================================================

/// Error payload carried by `result` and `nosub` frames.
///
/// # Format
///
/// ```json
/// { "error": 403, "reason": "Access denied", "details": { ... } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerError {
    /// Error code; servers send strings or numbers.
    #[serde(default)]
    pub error: Value,

    /// Human readable reason.
    #[serde(default)]
    pub reason: Option<String>,

    /// Structured details.
    #[serde(default)]
    pub details: Option<Value>,

    /// Fallback message some servers send instead of `reason`.
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerError {
    /// Returns the error code normalized to a string.
    #[must_use]
    pub fn code(&self) -> String {
        match &self.error {
            Value::String(code) => code.clone(),
            Value::Null => "unknown".to_string(),
            other => other.to_string(),
        }
    }

    /// Converts the payload into a crate [`Error::Server`].
    #[must_use]
    pub fn into_error(self) -> Error {
        let code = self.code();
        Error::server(code, self.reason.or(self.message), self.details)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connected() {
        let message = ServerMessage::decode(r#"{"msg":"connected","session":"abc"}"#);
        assert!(matches!(
            message,
            Some(ServerMessage::Connected { session: Some(ref s) }) if s == "abc"
        ));
    }

    #[test]
    fn test_decode_result_with_numeric_error_code() {
        let text = r#"{"msg":"result","id":"4","error":{"error":403,"reason":"Access denied"}}"#;
        let Some(ServerMessage::Result { id, error, result }) = ServerMessage::decode(text) else {
            panic!("expected result frame");
        };

        assert_eq!(id, "4");
        assert!(result.is_none());
        let err = error.expect("error payload").into_error();
        assert_eq!(err.code(), Some("403"));
        assert_eq!(err.to_string(), "Server error [403]: Access denied");
    }

    #[test]
    fn test_decode_changed_with_cleared() {
        let text = r#"{"msg":"changed","collection":"todos","id":"1","fields":{"a":1},"cleared":["b"]}"#;
        let Some(ServerMessage::Changed {
            collection,
            id,
            fields,
            cleared,
        }) = ServerMessage::decode(text)
        else {
            panic!("expected changed frame");
        };

        assert_eq!(collection, "todos");
        assert_eq!(id, "1");
        assert_eq!(fields.get("a"), Some(&Value::from(1)));
        assert_eq!(cleared, vec!["b".to_string()]);
    }

    #[test]
    fn test_decode_added_without_fields() {
        let text = r#"{"msg":"added","collection":"todos","id":"1"}"#;
        let Some(ServerMessage::Added { fields, .. }) = ServerMessage::decode(text) else {
            panic!("expected added frame");
        };
        assert!(fields.is_empty());
    }

    #[test]
    fn test_unknown_frames_are_not_decoded() {
        assert!(ServerMessage::decode(r#"{"msg":"addedBefore","collection":"x","id":"1"}"#).is_none());
        assert!(ServerMessage::decode(r#"{"server_id":"0"}"#).is_none());
        assert!(ServerMessage::decode("not json").is_none());
    }

    #[test]
    fn test_server_error_falls_back_to_message() {
        let payload = ServerError {
            error: Value::from("not-found"),
            reason: None,
            details: None,
            message: Some("Missing".into()),
        };
        assert_eq!(payload.into_error().to_string(), "Server error [not-found]: Missing");
    }
}

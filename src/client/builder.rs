//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and starting [`Client`] instances.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ddp_session::Client;
//!
//! # async fn example() -> ddp_session::Result<()> {
//! let client = Client::builder("wss://example.com/websocket")
//!     .reconnect_interval(Duration::from_secs(5))
//!     .collection("todos")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::config::{LogoutFailure, SessionConfig};
use crate::error::{Error, Result};
use crate::session::Transforms;
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{Transport, WebSocketTransport};

use super::auth::{ResumeHandler, resume_handler};
use super::core::Client;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
pub struct ClientBuilder {
    /// Session settings.
    config: SessionConfig,
    /// Mirrored collections.
    transforms: Transforms,
    /// Credential store, in-memory when unset.
    storage: Option<Arc<dyn Storage>>,
    /// Transport, WebSocket to the endpoint when unset.
    transport: Option<Box<dyn Transport>>,
    /// Replacement for token resumption.
    resume: Option<ResumeHandler>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("transforms", &self.transforms)
            .field("custom_storage", &self.storage.is_some())
            .field("custom_transport", &self.transport.is_some())
            .field("custom_resume", &self.resume.is_some())
            .finish()
    }
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(endpoint),
            transforms: Transforms::new(),
            storage: None,
            transport: None,
            resume: None,
        }
    }

    /// Connects as soon as the client is built (default `true`).
    #[inline]
    #[must_use]
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Reconnects after the connection drops (default `true`).
    #[inline]
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Sets the delay before reconnecting (default 10s).
    #[inline]
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Logs every raw frame under the `ddp_session::wire` target.
    #[inline]
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets what happens to the local session when `logout` fails.
    #[inline]
    #[must_use]
    pub fn logout_failure(mut self, policy: LogoutFailure) -> Self {
        self.config.logout_failure = policy;
        self
    }

    /// Sets the credential store.
    #[inline]
    #[must_use]
    pub fn storage(mut self, storage: impl Storage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Sets a shared credential store.
    #[inline]
    #[must_use]
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the WebSocket transport.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Replaces session resumption, run after every `connected`.
    ///
    /// By default the stored login token is sent to `login`. The handler's
    /// error is reported as a `ResumeLoginError` event. The method queue is
    /// held until the handler returns, so its own calls need
    /// [`CallOptions::skip_queue`](crate::CallOptions::skip_queue).
    #[must_use]
    pub fn resume_with<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.resume = Some(resume_handler(handler));
        self
    }

    /// Mirrors `collection` as-is.
    #[inline]
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.transforms.insert_identity(collection);
        self
    }

    /// Mirrors `collection`, passing each document through `transform`.
    ///
    /// The transform receives the raw document (with `_id`) and its output
    /// is what the snapshot stores.
    #[must_use]
    pub fn collection_with<F>(mut self, collection: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(collection, Arc::new(transform));
        self
    }

    /// Mirrors every collection the server publishes.
    #[inline]
    #[must_use]
    pub fn all_collections(mut self) -> Self {
        self.transforms.mirror_all();
        self
    }

    /// Validates the configuration and starts the client.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the endpoint is not a `ws`, `wss`, `http` or
    ///   `https` URL
    /// - [`Error::Config`] if the reconnect interval is zero
    /// - [`Error::Config`] if there is no Tokio runtime
    pub fn build(self) -> Result<Client> {
        let url = validate_endpoint(&self.config.endpoint)?;
        self.validate_interval()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("Client must be built within a Tokio runtime"))?;

        let transport: Box<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Box::new(WebSocketTransport::new(url)),
        };
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };

        Ok(Client::start(
            self.config,
            self.transforms,
            transport,
            storage,
            self.resume,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    fn validate_interval(&self) -> Result<()> {
        if self.config.reconnect_interval.is_zero() {
            return Err(Error::config(
                "Reconnect interval must be greater than zero.\n\
                 Example: Client::builder(url).reconnect_interval(Duration::from_secs(5))",
            ));
        }
        Ok(())
    }
}

/// Parses the endpoint and maps `http(s)` to `ws(s)`.
fn validate_endpoint(endpoint: &str) -> Result<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::config(format!("Invalid endpoint '{endpoint}': {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(Error::config(format!(
                "Unsupported endpoint scheme '{other}'. Use ws://, wss://, http:// or https://"
            )));
        }
    };

    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(Error::config(format!(
            "Cannot use endpoint '{endpoint}' as a WebSocket URL"
        )));
    }

    Ok(url.into())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::mock;

    #[test]
    fn test_new_uses_defaults() {
        let builder = ClientBuilder::new("ws://localhost:3000/websocket");
        assert_eq!(builder.config, SessionConfig::new("ws://localhost:3000/websocket"));
        assert!(builder.storage.is_none());
        assert!(builder.transport.is_none());
    }

    #[test]
    fn test_setters() {
        let builder = ClientBuilder::new("ws://localhost:3000/websocket")
            .auto_connect(false)
            .auto_reconnect(false)
            .reconnect_interval(Duration::from_millis(250))
            .debug(true)
            .logout_failure(LogoutFailure::KeepSession)
            .collection("todos");

        assert!(!builder.config.auto_connect);
        assert!(!builder.config.auto_reconnect);
        assert_eq!(builder.config.reconnect_interval, Duration::from_millis(250));
        assert!(builder.config.debug);
        assert_eq!(builder.config.logout_failure, LogoutFailure::KeepSession);
        assert!(builder.transforms.get("todos").is_some());
        assert!(builder.transforms.get("lists").is_none());
    }

    #[test]
    fn test_endpoint_schemes() {
        assert_eq!(
            validate_endpoint("http://localhost:3000/websocket").expect("http"),
            "ws://localhost:3000/websocket"
        );
        assert_eq!(
            validate_endpoint("https://example.com/websocket").expect("https"),
            "wss://example.com/websocket"
        );
        assert_eq!(
            validate_endpoint("ws://localhost:3000/websocket").expect("ws"),
            "ws://localhost:3000/websocket"
        );
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(matches!(
            validate_endpoint("not a url"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            validate_endpoint("ftp://example.com"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_build_requires_runtime() {
        let (transport, _server) = mock::pair();
        let result = ClientBuilder::new("ws://localhost:3000/websocket")
            .transport(transport)
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = ClientBuilder::new("ws://localhost:3000/websocket")
            .reconnect_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}

//! Client handle.
//!
//! [`Client`] is a cheap, cloneable handle to one DDP session. Every
//! operation is forwarded to the driver task that owns the session engine;
//! accessors read a snapshot the driver refreshes after each step.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::identifiers::{CallId, ListenerId, SubscriptionId};
use crate::session::{
    CallOptions, Collections, ConnectionStatus, EventBus, EventKind, Session, SessionEvent,
    SubscribeOptions, Transforms, validate_name,
};
use crate::storage::Storage;
use crate::transport::Transport;

use super::auth::ResumeHandler;
use super::builder::ClientBuilder;
use super::driver::{Command, Driver, SharedState};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the broadcast channel behind [`Client::events`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// ClientInner
// ============================================================================

/// State shared by every handle of one session.
pub(crate) struct ClientInner {
    /// Channel to the driver task.
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    /// Snapshot refreshed by the driver.
    shared: Arc<RwLock<SharedState>>,
    /// Source of [`Client::events`] receivers.
    broadcast: broadcast::Sender<SessionEvent>,
    /// Credential store.
    pub(crate) storage: Arc<dyn Storage>,
    /// Settings the session was built with.
    pub(crate) config: SessionConfig,
    /// Replacement for token resumption.
    pub(crate) resume: Option<ResumeHandler>,
}

// ============================================================================
// Client
// ============================================================================

/// Handle to a DDP session.
///
/// Dropping the last handle cancels outstanding calls and closes the
/// connection.
///
/// # Example
///
/// ```ignore
/// use ddp_session::Client;
/// use serde_json::json;
///
/// # async fn example() -> ddp_session::Result<()> {
/// let client = Client::builder("ws://localhost:3000/websocket")
///     .collection("todos")
///     .build()?;
///
/// let todos = client.subscribe("todos", vec![])?;
/// let id = client.call("todos.insert", vec![json!({"text": "milk"})]).await?;
///
/// todos.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.config.endpoint)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Constructor
// ============================================================================

impl Client {
    /// Returns a builder for a client talking to `endpoint`.
    #[inline]
    #[must_use]
    pub fn builder(endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Spawns the driver task. Must run inside a Tokio runtime.
    pub(crate) fn start(
        config: SessionConfig,
        transforms: Transforms,
        transport: Box<dyn Transport>,
        storage: Arc<dyn Storage>,
        resume: Option<ResumeHandler>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let bus = EventBus::with_broadcast(broadcast_tx.clone());
        let session = Session::new(&config, transforms, transport, events_tx, bus);
        let shared = Arc::new(RwLock::new(SharedState::default()));
        let auto_connect = config.auto_connect;

        let inner = Arc::new(ClientInner {
            commands: commands_tx,
            shared: Arc::clone(&shared),
            broadcast: broadcast_tx,
            storage,
            config,
            resume,
        });

        let driver = Driver::new(
            session,
            commands_rx,
            events_rx,
            shared,
            Arc::downgrade(&inner),
        );
        tokio::spawn(driver.run());

        debug!(endpoint = %inner.config.endpoint, "Client started");

        let client = Self { inner };
        if auto_connect {
            client.connect();
        }
        client
    }
}

// ============================================================================
// Client - Accessors
// ============================================================================

impl Client {
    /// Returns the current connection status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.read().status
    }

    /// Returns `true` once the handshake completed.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Returns the logged-in user id.
    #[inline]
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.inner.shared.read().user_id.clone()
    }

    /// Returns the current collections snapshot.
    ///
    /// During a reconnect this is the pre-drop snapshot until every
    /// subscription has been restored.
    #[inline]
    #[must_use]
    pub fn collections(&self) -> Collections {
        self.inner.shared.read().collections.clone()
    }

    /// Returns the session configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the credential store.
    #[inline]
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }
}

// ============================================================================
// Client - Connection
// ============================================================================

impl Client {
    /// Opens the connection and re-enables auto-reconnect.
    pub fn connect(&self) {
        let _ = self.send(Command::Connect);
    }

    /// Closes the connection and disables auto-reconnect.
    pub fn disconnect(&self) {
        let _ = self.send(Command::Disconnect);
    }

    /// Cancels outstanding calls and ends the session for every handle.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }
}

// ============================================================================
// Client - Methods
// ============================================================================

impl Client {
    /// Calls a server method with default options.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `name` is empty
    /// - [`Error::Server`] if the method failed on the server
    /// - [`Error::Canceled`] if the call was dropped locally
    pub async fn call(&self, name: impl Into<String>, params: Vec<Value>) -> Result<Value> {
        self.call_with(name, params, CallOptions::default()).await
    }

    /// Calls a server method.
    ///
    /// Resolves once the result arrived and its writes are visible in the
    /// collections.
    ///
    /// # Errors
    ///
    /// Same as [`Client::call`].
    pub async fn call_with(
        &self,
        name: impl Into<String>,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.call_with_callback(name, params, options, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await?
    }

    /// Calls a server method, delivering the outcome to `callback`.
    ///
    /// Returns the call id right away.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `name` is empty
    /// - [`Error::ConnectionClosed`] if the session was shut down
    pub fn call_with_callback<F>(
        &self,
        name: impl Into<String>,
        params: Vec<Value>,
        options: CallOptions,
        callback: F,
    ) -> Result<CallId>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let name = name.into();
        validate_name("method", &name)?;

        let id = CallId::next();
        self.send(Command::Call {
            id,
            name,
            params,
            options,
            callback: Box::new(callback),
        })?;
        Ok(id)
    }
}

// ============================================================================
// Client - Subscriptions
// ============================================================================

impl Client {
    /// Subscribes to a publication.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `name` is empty
    /// - [`Error::ConnectionClosed`] if the session was shut down
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_with(name, params, SubscribeOptions::default())
    }

    /// Subscribes to a publication with ready/stop hooks.
    ///
    /// # Errors
    ///
    /// Same as [`Client::subscribe`].
    pub fn subscribe_with(
        &self,
        name: impl Into<String>,
        params: Vec<Value>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let name = name.into();
        validate_name("publication", &name)?;

        let id = SubscriptionId::next();
        self.send(Command::Subscribe {
            id,
            name,
            params,
            options,
        })?;

        Ok(SubscriptionHandle {
            id,
            client: Arc::downgrade(&self.inner),
            stopped: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Client - Events
// ============================================================================

impl Client {
    /// Registers a listener for `kind`.
    ///
    /// Listeners run on the driver task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.listen(kind, false, Box::new(handler))
    }

    /// Registers a listener removed after its first invocation.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.listen(kind, true, Box::new(handler))
    }

    /// Removes a listener.
    pub fn off(&self, id: ListenerId) {
        let _ = self.send(Command::Off(id));
    }

    /// Returns a receiver of every event emitted from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.broadcast.subscribe()
    }

    fn listen(&self, kind: EventKind, once: bool, handler: crate::session::Listener) -> ListenerId {
        let id = ListenerId::next();
        let _ = self.send(Command::Listen {
            id,
            kind,
            once,
            handler,
        });
        id
    }
}

// ============================================================================
// Client - Internal
// ============================================================================

impl Client {
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.send(Command::Emit(event));
    }

    /// Sets the logged-in user; returns once accessors see it.
    pub(crate) async fn set_user(&self, user_id: Option<String>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::SetUser { user_id, done })?;
        rx.await?;
        Ok(())
    }
}

// ============================================================================
// SubscriptionHandle
// ============================================================================

/// Handle to a live subscription.
///
/// Dropping the handle does not stop the subscription; call
/// [`SubscriptionHandle::stop`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    client: Weak<ClientInner>,
    stopped: AtomicBool,
}

impl SubscriptionHandle {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stops the subscription. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            let _ = inner.commands.send(Command::Unsubscribe(self.id));
        }
    }

    /// Returns `true` once [`stop`](Self::stop) was called.
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInner")
            .field("endpoint", &self.config.endpoint)
            .field("custom_resume", &self.resume.is_some())
            .finish_non_exhaustive()
    }
}

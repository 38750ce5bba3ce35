//! Session lifecycle and data events.
//!
//! The engine owns an [`EventBus`]. Listeners registered with `on`/`once`
//! run synchronously inside the engine as events are emitted; every event
//! is also forwarded to a `tokio::sync::broadcast` channel for async
//! consumers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::error;

use crate::error::Error;
use crate::identifiers::ListenerId;

use super::collections::Collections;

// ============================================================================
// Types
// ============================================================================

/// Event listener callback.
pub type Listener = Box<dyn FnMut(&SessionEvent) + Send>;

// ============================================================================
// SessionEvent
// ============================================================================

/// An event emitted by the session engine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake done, session resumed, queue and subscriptions resent.
    Connected,
    /// Transport closed.
    Disconnected,
    /// Subscriptions are being resent after a reconnect.
    Restoring,
    /// All subscriptions restored and collections reconciled.
    Restored,
    /// Server `error` frame or transport failure.
    Error(Arc<Error>),
    /// A login routine started.
    LoggingIn,
    /// Login succeeded.
    LoggedIn {
        /// Authenticated user id.
        user_id: String,
    },
    /// Local session cleared.
    LoggedOut,
    /// Login failed or no stored token was available for resumption.
    LoginError(Arc<Error>),
    /// Automatic session resumption failed.
    ResumeLoginError(Arc<Error>),
    /// Logout call failed.
    LogoutError(Arc<Error>),
    /// Server `ready` frame.
    Ready {
        /// Subscription ids.
        subs: Vec<String>,
    },
    /// Server `updated` frame.
    Updated {
        /// Call ids.
        methods: Vec<String>,
    },
    /// Document added to a mirrored collection.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Raw fields.
        fields: Map<String, Value>,
    },
    /// Document changed in a mirrored collection.
    Changed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Raw changed fields.
        fields: Map<String, Value>,
        /// Cleared field names.
        cleared: Vec<String>,
    },
    /// Document removed from a mirrored collection.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// New collections snapshot.
    DataUpdated(Collections),
}

impl SessionEvent {
    /// Returns the event's discriminant.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Restoring => EventKind::Restoring,
            Self::Restored => EventKind::Restored,
            Self::Error(_) => EventKind::Error,
            Self::LoggingIn => EventKind::LoggingIn,
            Self::LoggedIn { .. } => EventKind::LoggedIn,
            Self::LoggedOut => EventKind::LoggedOut,
            Self::LoginError(_) => EventKind::LoginError,
            Self::ResumeLoginError(_) => EventKind::ResumeLoginError,
            Self::LogoutError(_) => EventKind::LogoutError,
            Self::Ready { .. } => EventKind::Ready,
            Self::Updated { .. } => EventKind::Updated,
            Self::Added { .. } => EventKind::Added,
            Self::Changed { .. } => EventKind::Changed,
            Self::Removed { .. } => EventKind::Removed,
            Self::DataUpdated(_) => EventKind::DataUpdated,
        }
    }

    /// Returns the carried error for error-class events.
    #[must_use]
    pub fn error(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Error(err)
            | Self::LoginError(err)
            | Self::ResumeLoginError(err)
            | Self::LogoutError(err) => Some(err),
            _ => None,
        }
    }
}

// ============================================================================
// EventKind
// ============================================================================

/// Discriminant of [`SessionEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session established and resumed.
    Connected,
    /// Transport closed.
    Disconnected,
    /// Resubscription after a reconnect started.
    Restoring,
    /// Every subscription restored after a reconnect.
    Restored,
    /// Transport or server error.
    Error,
    /// Login or resumption started.
    LoggingIn,
    /// Login succeeded.
    LoggedIn,
    /// Local session cleared.
    LoggedOut,
    /// Login failed.
    LoginError,
    /// Session resumption failed.
    ResumeLoginError,
    /// Logout call failed.
    LogoutError,
    /// `ready` frame received.
    Ready,
    /// `updated` frame received.
    Updated,
    /// Document added.
    Added,
    /// Document changed.
    Changed,
    /// Document removed.
    Removed,
    /// New collections snapshot.
    DataUpdated,
}

impl EventKind {
    /// Returns `true` for events that report a failure.
    #[inline]
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::Error | Self::LoginError | Self::ResumeLoginError | Self::LogoutError
        )
    }
}

// ============================================================================
// EventBus
// ============================================================================

struct Registration {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    handler: Listener,
}

/// Listener registry owned by the engine.
pub(crate) struct EventBus {
    listeners: Vec<Registration>,
    broadcast: Option<broadcast::Sender<SessionEvent>>,
}

impl EventBus {
    /// Creates a bus with no broadcast forwarding.
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            listeners: Vec::new(),
            broadcast: None,
        }
    }

    /// Creates a bus that also forwards every event to `broadcast`.
    pub(crate) fn with_broadcast(broadcast: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            listeners: Vec::new(),
            broadcast: Some(broadcast),
        }
    }

    /// Registers a listener.
    pub(crate) fn on(&mut self, id: ListenerId, kind: EventKind, handler: Listener) {
        self.listeners.push(Registration {
            id,
            kind,
            once: false,
            handler,
        });
    }

    /// Registers a listener removed after its first invocation.
    pub(crate) fn once(&mut self, id: ListenerId, kind: EventKind, handler: Listener) {
        self.listeners.push(Registration {
            id,
            kind,
            once: true,
            handler,
        });
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub(crate) fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|reg| reg.id != id);
        self.listeners.len() != before
    }

    /// Returns the number of listeners for `kind`.
    #[cfg(test)]
    pub(crate) fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.iter().filter(|reg| reg.kind == kind).count()
    }

    /// Delivers `event` to its listeners and the broadcast channel.
    ///
    /// Error-class events nobody listens to are logged.
    pub(crate) fn emit(&mut self, event: SessionEvent) {
        let kind = event.kind();
        let mut delivered = 0usize;

        self.listeners.retain_mut(|reg| {
            if reg.kind != kind {
                return true;
            }
            (reg.handler)(&event);
            delivered += 1;
            !reg.once
        });

        if kind.is_error() && delivered == 0 {
            let receivers = self.broadcast.as_ref().map_or(0, |tx| tx.receiver_count());
            if receivers == 0
                && let Some(err) = event.error()
            {
                error!(event = ?kind, error = %err, "Unhandled session error");
            }
        }

        if let Some(tx) = &self.broadcast {
            // No receivers is fine
            let _ = tx.send(event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(hits: &Arc<AtomicUsize>) -> Listener {
        let hits = Arc::clone(hits);
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_on_receives_matching_events() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on(ListenerId::next(), EventKind::Connected, counter(&hits));

        bus.emit(SessionEvent::Connected);
        bus.emit(SessionEvent::Disconnected);
        bus.emit(SessionEvent::Connected);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.once(ListenerId::next(), EventKind::Restored, counter(&hits));

        bus.emit(SessionEvent::Restored);
        bus.emit(SessionEvent::Restored);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Restored), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = ListenerId::next();
        bus.on(id, EventKind::LoggedOut, counter(&hits));

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(SessionEvent::LoggedOut);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_broadcast_forwarding() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut bus = EventBus::with_broadcast(tx);

        bus.emit(SessionEvent::Restoring);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Restoring)));
    }

    #[test]
    fn test_unhandled_error_does_not_panic() {
        let mut bus = EventBus::new();
        bus.emit(SessionEvent::Error(Arc::new(Error::connection("reset"))));
    }

    #[test]
    fn test_error_kinds() {
        assert!(EventKind::LoginError.is_error());
        assert!(EventKind::LogoutError.is_error());
        assert!(!EventKind::LoggedOut.is_error());
        let event = SessionEvent::ResumeLoginError(Arc::new(Error::canceled()));
        assert_eq!(event.kind(), EventKind::ResumeLoginError);
        assert!(event.error().is_some());
    }
}

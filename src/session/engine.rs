//! Session engine: the DDP protocol state machine.
//!
//! [`Session`] owns every piece of protocol state: connection status, the
//! method queue, in-flight calls, the subscription registry and the
//! collection mirror. It is synchronous and never spawns; effects it cannot
//! carry out itself (timers, session resumption) are pushed to an outbox
//! that its driver drains after every step.
//!
//! # Connection Lifecycle
//!
//! 1. Transport `Open` → send `connect`
//! 2. `connected` → status connected, snapshot collections, request resume
//! 3. Resume settled → resend in-flight calls, drain queue, resend subscriptions
//! 4. Every subscription ready → reconcile collections, emit `Restored`
//! 5. Transport `Close` → status disconnected, cancel non-retryable calls,
//!    schedule reconnect

// ============================================================================
// Imports
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::identifiers::{CallId, ListenerId, SubscriptionId};
use crate::protocol::{ClientMessage, ServerError, ServerMessage};
use crate::transport::{Transport, TransportEvent, TransportEvents};

use super::call::{CallCallback, CallOptions, PendingCall};
use super::collections::{Collections, Transforms};
use super::events::{EventBus, EventKind, Listener, SessionEvent};
use super::subscription::{PendingSubscription, SubscribeOptions};
use super::validate_name;

// ============================================================================
// Constants
// ============================================================================

/// Cancellation reason for calls dropped by a connection loss.
const CONNECTION_LOST: &str = "connection lost";

/// Cancellation reason for calls outstanding at shutdown.
const SHUT_DOWN: &str = "session shut down";

// ============================================================================
// ConnectionStatus
// ============================================================================

/// Observable connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No DDP session.
    #[default]
    Disconnected,
    /// Handshake completed.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

// ============================================================================
// Effect
// ============================================================================

/// Side effects requested from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Reopen the transport after the delay.
    ScheduleReconnect(Duration),
    /// Drop any scheduled reopen.
    CancelReconnect,
    /// Run session resumption, then report back with this generation.
    ResumeLogin(u64),
}

// ============================================================================
// Link
// ============================================================================

/// What the session last asked of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Link {
    /// No connection, or its `Close` has been handled.
    #[default]
    Idle,
    /// `open` issued and no `Close` seen yet.
    Active,
    /// `close` issued, waiting for the trailing `Close`.
    Closing,
}

// ============================================================================
// QueueEntry
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    id: CallId,
    wait: bool,
    cancel_on_reconnect: bool,
    /// Disconnect count when enqueued.
    epoch: u64,
}

// ============================================================================
// Session
// ============================================================================

/// DDP session state machine.
pub(crate) struct Session {
    transport: Box<dyn Transport>,
    transport_events: TransportEvents,
    transforms: Transforms,
    bus: EventBus,
    effects: Vec<Effect>,

    status: ConnectionStatus,
    link: Link,
    /// Open again as soon as the closing connection reports `Close`.
    reopen: bool,
    auto_reconnect: bool,
    configured_auto_reconnect: bool,
    reconnect_interval: Duration,
    debug: bool,
    /// Number of transport closes so far; doubles as resume generation.
    disconnects: u64,
    /// Set between `connected` and the end of session resumption.
    resuming: bool,

    calls: FxHashMap<CallId, PendingCall>,
    queue: VecDeque<QueueEntry>,
    in_flight: BTreeSet<CallId>,
    /// Outstanding `wait` calls; the queue holds while any is out.
    blocking_calls: BTreeSet<CallId>,
    /// Calls with a result but no `updated` when the connection dropped.
    awaiting_restore: Vec<CallId>,

    subscriptions: BTreeMap<SubscriptionId, PendingSubscription>,
    restores_pending: usize,

    collections: Collections,
    /// Pre-reconnect snapshot, served until the restore sweep reconciles it.
    previous_collections: Option<Collections>,

    user_id: Option<String>,
}

// ============================================================================
// Session - Constructor & Accessors
// ============================================================================

impl Session {
    /// Creates a disconnected session.
    pub(crate) fn new(
        config: &SessionConfig,
        transforms: Transforms,
        transport: Box<dyn Transport>,
        transport_events: TransportEvents,
        bus: EventBus,
    ) -> Self {
        Self {
            transport,
            transport_events,
            transforms,
            bus,
            effects: Vec::new(),
            status: ConnectionStatus::Disconnected,
            link: Link::Idle,
            reopen: false,
            auto_reconnect: config.auto_reconnect,
            configured_auto_reconnect: config.auto_reconnect,
            reconnect_interval: config.reconnect_interval,
            debug: config.debug,
            disconnects: 0,
            resuming: false,
            calls: FxHashMap::default(),
            queue: VecDeque::new(),
            in_flight: BTreeSet::new(),
            blocking_calls: BTreeSet::new(),
            awaiting_restore: Vec::new(),
            subscriptions: BTreeMap::new(),
            restores_pending: 0,
            collections: Collections::new(),
            previous_collections: None,
            user_id: None,
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[inline]
    pub(crate) fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Snapshot consumers should see.
    ///
    /// While a reconnect is being restored this is the pre-drop snapshot,
    /// so consumers never observe the transient empty state.
    #[inline]
    pub(crate) fn collections(&self) -> &Collections {
        self.previous_collections.as_ref().unwrap_or(&self.collections)
    }

    #[inline]
    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    #[inline]
    pub(crate) fn pending_call_count(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

// ============================================================================
// Session - Events
// ============================================================================

impl Session {
    pub(crate) fn on(&mut self, id: ListenerId, kind: EventKind, handler: Listener) {
        self.bus.on(id, kind, handler);
    }

    pub(crate) fn once(&mut self, id: ListenerId, kind: EventKind, handler: Listener) {
        self.bus.once(id, kind, handler);
    }

    pub(crate) fn off(&mut self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    pub(crate) fn emit(&mut self, event: SessionEvent) {
        trace!(event = ?event.kind(), "Emitting session event");
        self.bus.emit(event);
    }
}

// ============================================================================
// Session - Connection Control
// ============================================================================

impl Session {
    /// Opens the transport and re-arms auto-reconnect.
    pub(crate) fn connect(&mut self) {
        self.auto_reconnect = self.configured_auto_reconnect;
        info!("Opening transport");
        self.open_transport();
    }

    /// Reopens the transport from the reconnect timer.
    pub(crate) fn reconnect(&mut self) {
        if !self.auto_reconnect {
            return;
        }
        debug!("Reconnecting");
        self.open_transport();
    }

    /// Closes the transport and disables auto-reconnect.
    pub(crate) fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.effects.push(Effect::CancelReconnect);
        info!("Closing transport");
        self.close_transport();
    }

    /// Opens now, or once the closing connection is gone.
    fn open_transport(&mut self) {
        if self.link == Link::Closing {
            debug!("Transport still closing, reopening after close");
            self.reopen = true;
            return;
        }
        self.link = Link::Active;
        self.transport.open(self.transport_events.clone());
    }

    fn close_transport(&mut self) {
        self.reopen = false;
        if self.link == Link::Active {
            self.link = Link::Closing;
        }
        self.transport.close();
    }

    /// Cancels everything outstanding and closes the transport.
    pub(crate) fn shutdown(&mut self) {
        self.auto_reconnect = false;
        self.close_transport();

        for (_, mut call) in self.calls.drain() {
            call.cancel(Some(Error::canceled_with(SHUT_DOWN)));
        }
        self.queue.clear();
        self.in_flight.clear();
        self.blocking_calls.clear();

        for (_, mut sub) in std::mem::take(&mut self.subscriptions) {
            sub.cancel();
        }
        debug!("Session shut down");
    }
}

// ============================================================================
// Session - Transport Events
// ============================================================================

impl Session {
    /// Reacts to a transport event.
    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                debug!("Transport open, sending handshake");
                self.send(ClientMessage::connect());
            }
            TransportEvent::Close => self.on_close(),
            TransportEvent::Message(text) => self.handle_text(&text),
            TransportEvent::Error(message) => {
                self.emit(SessionEvent::Error(Arc::new(Error::connection(message))));
            }
        }
    }

    fn on_close(&mut self) {
        let was_connected = self.status == ConnectionStatus::Connected;
        self.status = ConnectionStatus::Disconnected;
        self.disconnects += 1;
        self.resuming = false;
        // The sweep restarts from scratch after the next handshake
        self.restores_pending = 0;
        self.awaiting_restore.clear();

        if was_connected {
            info!(in_flight = self.in_flight.len(), queued = self.queue.len(), "Connection lost");
        } else {
            debug!("Connection attempt ended");
        }

        self.discard_cancelable_calls();
        self.emit(SessionEvent::Disconnected);

        self.link = Link::Idle;
        if std::mem::take(&mut self.reopen) {
            debug!("Reopening transport");
            self.open_transport();
        } else if self.auto_reconnect {
            debug!(
                interval_ms = self.reconnect_interval.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.effects
                .push(Effect::ScheduleReconnect(self.reconnect_interval));
        }
    }

    fn handle_text(&mut self, text: &str) {
        if self.debug {
            debug!(target: "ddp_session::wire", frame = %text, "DDP/IN");
        }

        match ServerMessage::decode(text) {
            Some(message) => self.handle_message(message),
            None => trace!(frame = %text, "Ignoring unrecognized frame"),
        }
    }

    /// Dispatches a decoded server frame.
    pub(crate) fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { session } => self.on_connected(session),

            ServerMessage::Ping { id } => self.send(ClientMessage::Pong { id }),

            ServerMessage::Ready { subs } => self.on_ready(subs),

            ServerMessage::Nosub { id, error } => {
                self.on_nosub(&id, error.map(ServerError::into_error));
            }

            ServerMessage::Result { id, error, result } => {
                let outcome = match error {
                    Some(error) => Err(error.into_error()),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                self.on_result(&id, outcome);
            }

            ServerMessage::Updated { methods } => self.on_updated(methods),

            ServerMessage::Error {
                reason,
                offending_message,
            } => {
                warn!(reason = ?reason, "Server rejected a frame");
                let error = Error::server("DDPError", reason, offending_message);
                self.emit(SessionEvent::Error(Arc::new(error)));
            }

            ServerMessage::Added {
                collection,
                id,
                fields,
            } => self.on_added(collection, id, fields),

            ServerMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => self.on_changed(collection, id, fields, cleared),

            ServerMessage::Removed { collection, id } => self.on_removed(collection, id),
        }
    }

    fn on_connected(&mut self, session: Option<String>) {
        info!(session = ?session, "DDP session established");
        self.status = ConnectionStatus::Connected;
        self.resuming = true;
        self.discard_cancelable_calls();

        // An interrupted restore keeps its original snapshot
        let current = std::mem::take(&mut self.collections);
        if self.previous_collections.is_none() {
            self.previous_collections = Some(current);
        }

        self.effects.push(Effect::ResumeLogin(self.disconnects));
    }

    /// Continues the `connected` transition once session resumption settled.
    ///
    /// Stale generations (from a connection that has since dropped) are
    /// ignored.
    pub(crate) fn finish_resume(&mut self, generation: u64) {
        if !self.resuming
            || generation != self.disconnects
            || self.status != ConnectionStatus::Connected
        {
            debug!(generation, "Ignoring stale resume");
            return;
        }
        self.resuming = false;

        self.restore_in_flight_calls();
        self.drain_queue();
        self.restore_subscriptions();
        self.emit(SessionEvent::Connected);
    }
}

// ============================================================================
// Session - Methods
// ============================================================================

impl Session {
    /// Registers a call and queues or sends it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `name` is empty.
    pub(crate) fn call(
        &mut self,
        id: CallId,
        name: String,
        params: Vec<Value>,
        options: CallOptions,
        callback: CallCallback,
    ) -> Result<CallId> {
        validate_name("method", &name)?;

        let CallOptions {
            wait,
            no_retry,
            cancel_on_reconnect,
            skip_queue,
            on_result_received,
        } = options;

        self.calls.insert(
            id,
            PendingCall::new(name, params, no_retry, on_result_received, callback),
        );

        if skip_queue && self.status == ConnectionStatus::Connected {
            self.dispatch(id, wait);
            return Ok(id);
        }

        let entry = QueueEntry {
            id,
            wait,
            cancel_on_reconnect,
            epoch: self.disconnects,
        };
        if skip_queue {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }
        self.drain_queue();

        Ok(id)
    }

    /// Sends queued calls until the queue is empty or a `wait` call is out.
    fn drain_queue(&mut self) {
        if !self.blocking_calls.is_empty()
            || self.resuming
            || self.status != ConnectionStatus::Connected
        {
            return;
        }

        while let Some(entry) = self.queue.pop_front() {
            let Some(call) = self.calls.get(&entry.id) else {
                continue;
            };
            if call.is_canceled() {
                self.calls.remove(&entry.id);
                continue;
            }

            self.dispatch(entry.id, entry.wait);
            if entry.wait {
                return;
            }
        }
    }

    fn dispatch(&mut self, id: CallId, wait: bool) {
        let Some(call) = self.calls.get(&id) else {
            return;
        };
        trace!(id = %id, method = %call.name(), wait, "Sending call");
        let message = call.to_message(id);
        self.send(message);
        self.in_flight.insert(id);
        if wait {
            self.blocking_calls.insert(id);
        }
    }

    /// Drops bookkeeping of a completed call and unblocks the queue.
    fn finish_call(&mut self, id: CallId) {
        self.calls.remove(&id);
        self.in_flight.remove(&id);
        if self.blocking_calls.remove(&id) {
            self.drain_queue();
        }
    }

    /// Cancels in-flight `no_retry` calls and queued `cancel_on_reconnect`
    /// calls that were queued before the latest drop.
    fn discard_cancelable_calls(&mut self) {
        let doomed: Vec<CallId> = self
            .in_flight
            .iter()
            .copied()
            .filter(|id| self.calls.get(id).is_some_and(PendingCall::no_retry))
            .collect();

        for id in doomed {
            if let Some(call) = self.calls.get_mut(&id) {
                debug!(id = %id, method = %call.name(), "Canceling non-retryable call");
                call.cancel(Some(Error::canceled_with(CONNECTION_LOST)));
            }
            self.finish_call(id);
        }

        let epoch = self.disconnects;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for entry in std::mem::take(&mut self.queue) {
            if entry.cancel_on_reconnect && entry.epoch < epoch {
                if let Some(mut call) = self.calls.remove(&entry.id) {
                    debug!(id = %entry.id, method = %call.name(), "Dropping queued call");
                    call.cancel(Some(Error::canceled_with(CONNECTION_LOST)));
                }
            } else {
                kept.push_back(entry);
            }
        }
        self.queue = kept;
    }

    /// Resends in-flight calls that have no result yet.
    fn restore_in_flight_calls(&mut self) {
        let ids: Vec<CallId> = self.in_flight.iter().copied().collect();
        for id in ids {
            let Some(call) = self.calls.get(&id) else {
                continue;
            };
            if call.is_canceled() || call.is_completed() {
                continue;
            }

            if !call.has_result() {
                debug!(id = %id, method = %call.name(), "Resending in-flight call");
                let message = call.to_message(id);
                self.send(message);
            } else if !call.is_data_visible() {
                self.awaiting_restore.push(id);
            }
        }
    }

    fn on_result(&mut self, raw_id: &str, outcome: Result<Value>) {
        let Some(id) = CallId::parse(raw_id) else {
            trace!(id = %raw_id, "Result for foreign call id");
            return;
        };
        let completed = match self.calls.get_mut(&id) {
            Some(call) => call.record_result(outcome),
            None => {
                debug!(id = %id, "Result for unknown call");
                return;
            }
        };
        if completed {
            self.finish_call(id);
        }
    }

    fn on_updated(&mut self, methods: Vec<String>) {
        let ids: Vec<CallId> = methods.iter().filter_map(|raw| CallId::parse(raw)).collect();
        self.emit(SessionEvent::Updated { methods });

        for id in ids {
            let completed = self
                .calls
                .get_mut(&id)
                .is_some_and(PendingCall::mark_data_visible);
            if completed {
                self.finish_call(id);
            }
        }
    }
}

// ============================================================================
// Session - Subscriptions
// ============================================================================

impl Session {
    /// Registers a subscription, sending it right away when connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `name` is empty.
    pub(crate) fn subscribe(
        &mut self,
        id: SubscriptionId,
        name: String,
        params: Vec<Value>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        validate_name("publication", &name)?;

        let sub = PendingSubscription::new(name, params, options);
        if self.status == ConnectionStatus::Connected && !self.resuming {
            let message = sub.to_message(id);
            self.send(message);
        }
        self.subscriptions.insert(id, sub);

        Ok(id)
    }

    /// Stops a subscription. Unknown or already stopped ids are a no-op.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(mut sub) = self.subscriptions.remove(&id) else {
            return;
        };
        debug!(id = %id, name = %sub.name(), "Stopping subscription");

        if self.status == ConnectionStatus::Connected {
            self.send(ClientMessage::Unsub { id });
        }
        if sub.cancel() {
            self.restore_settled();
        }
    }

    fn on_ready(&mut self, subs: Vec<String>) {
        let ids: Vec<SubscriptionId> = subs
            .iter()
            .filter_map(|raw| SubscriptionId::parse(raw))
            .collect();
        self.emit(SessionEvent::Ready { subs });

        for id in ids {
            let settled = self
                .subscriptions
                .get_mut(&id)
                .is_some_and(PendingSubscription::mark_ready);
            if settled {
                self.restore_settled();
            }
        }
    }

    fn on_nosub(&mut self, raw_id: &str, error: Option<Error>) {
        let Some(id) = SubscriptionId::parse(raw_id) else {
            trace!(id = %raw_id, "nosub for foreign subscription id");
            return;
        };
        let Some(mut sub) = self.subscriptions.remove(&id) else {
            trace!(id = %id, "nosub for unknown subscription");
            return;
        };

        debug!(id = %id, name = %sub.name(), error = ?error, "Subscription stopped by server");
        if sub.mark_stopped(error) {
            self.restore_settled();
        }
    }

    /// Resends every registered subscription.
    fn restore_subscriptions(&mut self) {
        if self.subscriptions.is_empty() {
            self.finish_restore();
            return;
        }

        self.restores_pending = self.subscriptions.len();
        self.emit(SessionEvent::Restoring);

        let frames: Vec<ClientMessage> = self
            .subscriptions
            .iter_mut()
            .map(|(id, sub)| {
                sub.begin_restore();
                sub.to_message(*id)
            })
            .collect();

        debug!(count = frames.len(), "Restoring subscriptions");
        for frame in frames {
            self.send(frame);
        }
    }

    fn restore_settled(&mut self) {
        if self.restores_pending == 0 {
            return;
        }
        self.restores_pending -= 1;
        if self.restores_pending == 0 {
            self.finish_restore();
        }
    }

    /// Reconciles collections and releases calls waiting on the restore.
    fn finish_restore(&mut self) {
        if let Some(previous) = self.previous_collections.take() {
            self.collections = Collections::reconcile(&previous, &self.collections);
            if !self.collections.ptr_eq(&previous) {
                self.emit(SessionEvent::DataUpdated(self.collections.clone()));
            }
        }

        // The server never sends `updated` for these after a reconnect
        for id in std::mem::take(&mut self.awaiting_restore) {
            let completed = self
                .calls
                .get_mut(&id)
                .is_some_and(PendingCall::mark_data_visible);
            if completed {
                self.finish_call(id);
            }
        }

        info!("Subscriptions restored");
        self.emit(SessionEvent::Restored);
    }
}

// ============================================================================
// Session - Collections
// ============================================================================

impl Session {
    fn on_added(&mut self, collection: String, id: String, fields: Map<String, Value>) {
        let Some(transform) = self.transforms.get(&collection) else {
            trace!(collection = %collection, "Ignoring unmirrored collection");
            return;
        };
        self.collections = self
            .collections
            .added(transform, &collection, &id, fields.clone());

        self.maybe_emit_data_updated();
        self.emit(SessionEvent::Added {
            collection,
            id,
            fields,
        });
    }

    fn on_changed(
        &mut self,
        collection: String,
        id: String,
        fields: Map<String, Value>,
        cleared: Vec<String>,
    ) {
        let Some(transform) = self.transforms.get(&collection) else {
            trace!(collection = %collection, "Ignoring unmirrored collection");
            return;
        };
        self.collections =
            self.collections
                .changed(transform, &collection, &id, fields.clone(), &cleared);

        self.maybe_emit_data_updated();
        self.emit(SessionEvent::Changed {
            collection,
            id,
            fields,
            cleared,
        });
    }

    fn on_removed(&mut self, collection: String, id: String) {
        if self.transforms.get(&collection).is_none() {
            trace!(collection = %collection, "Ignoring unmirrored collection");
            return;
        }
        self.collections = self.collections.removed(&collection, &id);

        self.maybe_emit_data_updated();
        self.emit(SessionEvent::Removed { collection, id });
    }

    /// Snapshot events are held back while a restore is pending.
    fn maybe_emit_data_updated(&mut self) {
        if self.previous_collections.is_none() {
            self.emit(SessionEvent::DataUpdated(self.collections.clone()));
        }
    }
}

// ============================================================================
// Session - Login State
// ============================================================================

impl Session {
    pub(crate) fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }
}

// ============================================================================
// Session - Wire
// ============================================================================

impl Session {
    fn send(&mut self, message: ClientMessage) {
        match message.to_json() {
            Ok(text) => {
                if self.debug {
                    debug!(target: "ddp_session::wire", frame = %text, "DDP/OUT");
                }
                self.transport.send(text);
            }
            Err(e) => warn!(kind = message.kind(), error = %e, "Failed to encode frame"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("calls", &self.pending_call_count())
            .field("queued", &self.queue.len())
            .field("subscriptions", &self.subscription_count())
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::transport::mock::{self, MockServer};

    type Outcomes = Arc<Mutex<Vec<Result<Value>>>>;
    type Seen = Arc<Mutex<Vec<EventKind>>>;

    const ALL_LIFECYCLE: &[EventKind] = &[
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Restoring,
        EventKind::Restored,
        EventKind::DataUpdated,
        EventKind::Added,
        EventKind::Removed,
    ];

    struct Harness {
        session: Session,
        server: MockServer,
        _events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness() -> Harness {
        let mut config = SessionConfig::new("ws://test/websocket");
        config.reconnect_interval = Duration::from_millis(50);
        let mut transforms = Transforms::new();
        transforms.insert_identity("todos");

        let (transport, server) = mock::pair();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::new(&config, transforms, Box::new(transport), events_tx, EventBus::new());

        Harness {
            session,
            server,
            _events: events_rx,
        }
    }

    impl Harness {
        /// Runs the full handshake, with resumption settling immediately.
        fn connect(&mut self) {
            self.session.connect();
            self.session.handle_transport_event(TransportEvent::Open);
            self.frame(json!({"msg": "connected", "session": "s"}));
            self.settle_resume();
        }

        fn reconnect(&mut self) {
            self.session.handle_transport_event(TransportEvent::Open);
            self.frame(json!({"msg": "connected"}));
            self.settle_resume();
        }

        fn settle_resume(&mut self) {
            for effect in self.session.take_effects() {
                if let Effect::ResumeLogin(generation) = effect {
                    self.session.finish_resume(generation);
                }
            }
        }

        fn drop_connection(&mut self) {
            self.session.handle_transport_event(TransportEvent::Close);
        }

        fn frame(&mut self, frame: Value) {
            self.session
                .handle_transport_event(TransportEvent::Message(frame.to_string()));
        }

        fn sent(&mut self) -> Vec<Value> {
            self.server.drain_sent()
        }

        fn sent_of(&mut self, kind: &str) -> Vec<Value> {
            self.sent().into_iter().filter(|f| f["msg"] == kind).collect()
        }

        fn call(&mut self, name: &str, options: CallOptions) -> (CallId, Outcomes) {
            let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&outcomes);
            let id = self
                .session
                .call(
                    CallId::next(),
                    name.to_string(),
                    vec![json!(1)],
                    options,
                    Box::new(move |outcome: Result<Value>| sink.lock().push(outcome)),
                )
                .expect("valid call");
            (id, outcomes)
        }

        fn subscribe(&mut self, name: &str) -> SubscriptionId {
            self.session
                .subscribe(SubscriptionId::next(), name.to_string(), vec![], SubscribeOptions::new())
                .expect("valid subscription")
        }

        fn record(&mut self, kinds: &[EventKind]) -> Seen {
            let seen: Seen = Arc::new(Mutex::new(Vec::new()));
            for &kind in kinds {
                let sink = Arc::clone(&seen);
                self.session.on(
                    ListenerId::next(),
                    kind,
                    Box::new(move |event: &SessionEvent| sink.lock().push(event.kind())),
                );
            }
            seen
        }

        fn complete(&mut self, id: CallId, result: Value) {
            self.frame(json!({"msg": "result", "id": id.to_string(), "result": result}));
            self.frame(json!({"msg": "updated", "methods": [id.to_string()]}));
        }
    }

    #[test]
    fn test_open_sends_connect_handshake() {
        let mut h = harness();
        h.session.connect();
        h.session.handle_transport_event(TransportEvent::Open);

        assert_eq!(
            h.sent(),
            vec![json!({"msg": "connect", "version": "1", "support": ["1"]})]
        );
        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connected_requires_resume_before_connected_event() {
        let mut h = harness();
        let seen = h.record(&[EventKind::Connected]);

        h.session.connect();
        h.session.handle_transport_event(TransportEvent::Open);
        h.frame(json!({"msg": "connected"}));

        assert_eq!(h.session.status(), ConnectionStatus::Connected);
        assert!(seen.lock().is_empty());

        h.settle_resume();
        assert_eq!(*seen.lock(), vec![EventKind::Connected]);
    }

    #[test]
    fn test_connect_while_closing_reopens_on_close() {
        let mut h = harness();
        h.session.configured_auto_reconnect = false;
        h.connect();
        assert_eq!(h.server.opens(), 1);

        h.session.disconnect();
        h.session.connect();
        // The old connection has not reported Close yet
        assert_eq!(h.server.opens(), 1);

        h.session.take_effects();
        h.drop_connection();
        assert_eq!(h.server.opens(), 2);
        assert!(
            !h.session
                .take_effects()
                .iter()
                .any(|effect| matches!(effect, Effect::ScheduleReconnect(_)))
        );
    }

    #[test]
    fn test_disconnect_cancels_pending_reopen() {
        let mut h = harness();
        h.connect();

        h.session.disconnect();
        h.session.connect();
        h.session.disconnect();
        h.drop_connection();

        assert_eq!(h.server.opens(), 1);
        assert!(
            !h.session
                .take_effects()
                .iter()
                .any(|effect| matches!(effect, Effect::ScheduleReconnect(_)))
        );
    }

    #[test]
    fn test_ping_replies_pong_with_same_id() {
        let mut h = harness();
        h.connect();
        h.sent();

        h.frame(json!({"msg": "ping", "id": "p1"}));
        h.frame(json!({"msg": "ping"}));
        assert_eq!(
            h.sent(),
            vec![json!({"msg": "pong", "id": "p1"}), json!({"msg": "pong"})]
        );
    }

    #[test]
    fn test_unknown_frames_are_ignored() {
        let mut h = harness();
        h.connect();
        h.sent();

        h.session
            .handle_transport_event(TransportEvent::Message("garbage".to_string()));
        h.frame(json!({"msg": "addedBefore", "collection": "todos", "id": "1"}));
        h.frame(json!({"server_id": "0"}));

        assert!(h.sent().is_empty());
        assert_eq!(h.session.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_call_completes_once_after_result_and_updated() {
        let mut h = harness();
        h.connect();
        h.sent();

        let (id, outcomes) = h.call("todos.insert", CallOptions::new());
        let frames = h.sent();
        assert_eq!(
            frames,
            vec![json!({"msg": "method", "id": id.to_string(), "method": "todos.insert", "params": [1]})]
        );

        h.frame(json!({"msg": "result", "id": id.to_string(), "result": "ok"}));
        assert!(outcomes.lock().is_empty());

        h.frame(json!({"msg": "updated", "methods": [id.to_string()]}));
        h.frame(json!({"msg": "updated", "methods": [id.to_string()]}));
        h.frame(json!({"msg": "result", "id": id.to_string(), "result": "again"}));

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().ok(), Some(&json!("ok")));
        assert_eq!(h.session.pending_call_count(), 0);
    }

    #[test]
    fn test_server_error_result() {
        let mut h = harness();
        h.connect();

        let (id, outcomes) = h.call("secret", CallOptions::new());
        h.frame(json!({
            "msg": "result",
            "id": id.to_string(),
            "error": {"error": 403, "reason": "Access denied"}
        }));
        h.frame(json!({"msg": "updated", "methods": [id.to_string()]}));

        let outcomes = outcomes.lock();
        let err = outcomes[0].as_ref().expect_err("server error");
        assert!(err.is_server_error());
        assert_eq!(err.code(), Some("403"));
    }

    #[test]
    fn test_wait_call_blocks_later_calls() {
        let mut h = harness();
        h.connect();
        h.sent();

        let (a, a_done) = h.call("a", CallOptions::new().wait());
        let (b, b_done) = h.call("b", CallOptions::new());

        let frames = h.sent_of("method");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], a.to_string());

        h.frame(json!({"msg": "result", "id": a.to_string(), "result": 1}));
        assert!(h.sent_of("method").is_empty());

        h.frame(json!({"msg": "updated", "methods": [a.to_string()]}));
        assert_eq!(a_done.lock().len(), 1);

        let frames = h.sent_of("method");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], b.to_string());

        h.complete(b, json!(2));
        assert_eq!(b_done.lock().len(), 1);
    }

    #[test]
    fn test_skip_queue_bypasses_blocking_call() {
        let mut h = harness();
        h.connect();
        h.sent();

        let (a, _) = h.call("a", CallOptions::new().wait());
        let (_, _) = h.call("b", CallOptions::new());
        let (c, _) = h.call("c", CallOptions::new().skip_queue());

        let ids: Vec<Value> = h.sent_of("method").into_iter().map(|f| f["id"].clone()).collect();
        assert_eq!(ids, vec![json!(a.to_string()), json!(c.to_string())]);
    }

    #[test]
    fn test_skipped_wait_call_keeps_queue_blocked() {
        let mut h = harness();
        h.connect();
        h.sent();

        let (slow, _) = h.call("slow", CallOptions::new().wait());
        let (login, _) = h.call("login", CallOptions::new().wait().skip_queue());
        let (after, _) = h.call("needs_auth", CallOptions::new());
        assert_eq!(h.sent_of("method").len(), 2);

        h.complete(slow, json!(1));
        assert!(h.sent_of("method").is_empty());

        h.complete(login, json!({"id": "u1"}));
        let frames = h.sent_of("method");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], after.to_string());
    }

    #[test]
    fn test_skip_queue_while_disconnected_goes_first() {
        let mut h = harness();

        let (a, _) = h.call("a", CallOptions::new());
        let (b, _) = h.call("b", CallOptions::new().skip_queue());
        h.connect();

        let ids: Vec<Value> = h.sent_of("method").into_iter().map(|f| f["id"].clone()).collect();
        assert_eq!(ids, vec![json!(b.to_string()), json!(a.to_string())]);
    }

    #[test]
    fn test_queue_waits_for_resume() {
        let mut h = harness();
        let (_, _) = h.call("queued", CallOptions::new());

        h.session.connect();
        h.session.handle_transport_event(TransportEvent::Open);
        h.frame(json!({"msg": "connected"}));
        assert!(h.sent_of("method").is_empty());

        h.settle_resume();
        assert_eq!(h.sent_of("method").len(), 1);
    }

    #[test]
    fn test_no_retry_call_canceled_once_on_disconnect() {
        let mut h = harness();
        h.connect();

        let (id, outcomes) = h.call("charge", CallOptions::new().no_retry());
        h.sent();
        h.drop_connection();

        {
            let outcomes = outcomes.lock();
            assert_eq!(outcomes.len(), 1);
            assert!(outcomes[0].as_ref().is_err_and(Error::is_canceled));
        }

        h.reconnect();
        assert!(h.sent_of("method").is_empty());

        h.complete(id, json!(null));
        assert_eq!(outcomes.lock().len(), 1);
    }

    #[test]
    fn test_retryable_call_resent_with_same_id() {
        let mut h = harness();
        h.connect();

        let (id, outcomes) = h.call("save", CallOptions::new());
        let original = h.sent_of("method");
        h.drop_connection();
        assert!(outcomes.lock().is_empty());

        h.reconnect();
        let resent = h.sent_of("method");
        assert_eq!(resent, original);

        h.complete(id, json!("saved"));
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().ok(), Some(&json!("saved")));
    }

    #[test]
    fn test_cancel_on_reconnect_drops_queued_call() {
        let mut h = harness();
        h.connect();

        let (a, _) = h.call("a", CallOptions::new().wait());
        let (_, b_done) = h.call("b", CallOptions::new().cancel_on_reconnect());
        h.sent();

        h.drop_connection();
        assert!(b_done.lock()[0].as_ref().is_err_and(Error::is_canceled));

        // Queued while disconnected: survives the next reconnect
        let (_, c_done) = h.call("c", CallOptions::new().cancel_on_reconnect());
        h.reconnect();
        assert!(c_done.lock().is_empty());

        let ids: Vec<Value> = h.sent_of("method").into_iter().map(|f| f["id"].clone()).collect();
        assert_eq!(ids, vec![json!(a.to_string())]);

        h.complete(a, json!(null));
        assert_eq!(h.sent_of("method").len(), 1);
    }

    #[test]
    fn test_result_without_updated_released_after_restore() {
        let mut h = harness();
        h.connect();

        let (id, outcomes) = h.call("m", CallOptions::new());
        h.frame(json!({"msg": "result", "id": id.to_string(), "result": 5}));
        h.drop_connection();
        h.sent();

        h.reconnect();
        assert!(h.sent_of("method").is_empty());
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().ok(), Some(&json!(5)));
    }

    #[test]
    fn test_subscription_sent_when_connected() {
        let mut h = harness();
        h.connect();
        h.sent();

        let id = h.subscribe("todos");
        assert_eq!(
            h.sent(),
            vec![json!({"msg": "sub", "id": id.to_string(), "name": "todos", "params": []})]
        );
    }

    #[test]
    fn test_restore_subscriptions_on_reconnect() {
        let mut h = harness();
        h.connect();
        let a = h.subscribe("todos");
        let b = h.subscribe("lists");
        h.frame(json!({"msg": "ready", "subs": [a.to_string(), b.to_string()]}));
        h.drop_connection();
        h.sent();

        let seen = h.record(&[EventKind::Restoring, EventKind::Restored, EventKind::Connected]);
        h.reconnect();

        let resent: Vec<Value> = h.sent_of("sub").into_iter().map(|f| f["id"].clone()).collect();
        assert_eq!(resent, vec![json!(a.to_string()), json!(b.to_string())]);
        assert_eq!(*seen.lock(), vec![EventKind::Restoring, EventKind::Connected]);

        h.frame(json!({"msg": "ready", "subs": [a.to_string()]}));
        assert!(!seen.lock().contains(&EventKind::Restored));

        h.frame(json!({"msg": "ready", "subs": [b.to_string()]}));
        h.frame(json!({"msg": "ready", "subs": [a.to_string(), b.to_string()]}));
        let restored = seen.lock().iter().filter(|k| **k == EventKind::Restored).count();
        assert_eq!(restored, 1);
    }

    #[test]
    fn test_restored_fires_immediately_without_subscriptions() {
        let mut h = harness();
        let seen = h.record(&[EventKind::Restoring, EventKind::Restored]);
        h.connect();

        assert_eq!(*seen.lock(), vec![EventKind::Restored]);
    }

    #[test]
    fn test_stop_during_restore_settles_it() {
        let mut h = harness();
        h.connect();
        let a = h.subscribe("todos");
        let b = h.subscribe("lists");
        h.drop_connection();

        let seen = h.record(&[EventKind::Restored]);
        h.reconnect();
        h.frame(json!({"msg": "ready", "subs": [a.to_string()]}));
        h.session.unsubscribe(b);

        assert_eq!(*seen.lock(), vec![EventKind::Restored]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let stops = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&stops);
        let mut h = harness();
        h.connect();
        let id = h
            .session
            .subscribe(
                SubscriptionId::next(),
                "todos".into(),
                vec![],
                SubscribeOptions::new().on_stop(move |_| *sink.lock() += 1),
            )
            .expect("valid");
        h.sent();

        h.session.unsubscribe(id);
        h.session.unsubscribe(id);

        assert_eq!(h.sent(), vec![json!({"msg": "unsub", "id": id.to_string()})]);
        assert_eq!(*stops.lock(), 1);
        assert_eq!(h.session.subscription_count(), 0);
    }

    #[test]
    fn test_nosub_removes_subscription() {
        let mut h = harness();
        h.connect();
        let id = h.subscribe("todos");
        h.frame(json!({"msg": "nosub", "id": id.to_string(), "error": {"error": "not-found"}}));
        assert_eq!(h.session.subscription_count(), 0);

        h.drop_connection();
        h.sent();
        h.reconnect();
        assert!(h.sent_of("sub").is_empty());
    }

    #[test]
    fn test_added_and_removed_documents() {
        let mut h = harness();
        h.connect();
        h.subscribe("todos");
        let seen = h.record(ALL_LIFECYCLE);

        h.frame(json!({"msg": "added", "collection": "todos", "id": "1", "fields": {"name": "a"}}));
        assert_eq!(
            h.session.collections().document("todos", "1").map(|d| d.as_ref().clone()),
            Some(json!({"_id": "1", "name": "a"}))
        );
        let captured = h.session.collections().clone();

        h.frame(json!({"msg": "removed", "collection": "todos", "id": "1"}));
        assert!(h.session.collections().document("todos", "1").is_none());
        assert!(captured.document("todos", "1").is_some());

        assert_eq!(
            *seen.lock(),
            vec![
                EventKind::DataUpdated,
                EventKind::Added,
                EventKind::DataUpdated,
                EventKind::Removed
            ]
        );
    }

    #[test]
    fn test_changed_without_added() {
        let mut h = harness();
        h.connect();

        h.frame(json!({"msg": "changed", "collection": "todos", "id": "9", "fields": {"done": true}}));
        assert_eq!(
            h.session.collections().document("todos", "9").map(|d| d.as_ref().clone()),
            Some(json!({"_id": "9", "done": true}))
        );
    }

    #[test]
    fn test_unmirrored_collection_is_ignored() {
        let mut h = harness();
        h.connect();
        let seen = h.record(ALL_LIFECYCLE);

        h.frame(json!({"msg": "added", "collection": "users", "id": "1", "fields": {}}));
        assert!(h.session.collections().get("users").is_none());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_reconnect_keeps_snapshot_until_restored() {
        let mut h = harness();
        h.connect();
        let sub = h.subscribe("todos");
        h.frame(json!({"msg": "added", "collection": "todos", "id": "1", "fields": {"n": 1}}));
        h.frame(json!({"msg": "added", "collection": "todos", "id": "2", "fields": {"n": 2}}));
        h.frame(json!({"msg": "ready", "subs": [sub.to_string()]}));
        let before = h.session.collections().clone();

        h.drop_connection();
        let seen = h.record(&[EventKind::DataUpdated, EventKind::Restored]);
        h.reconnect();

        h.frame(json!({"msg": "added", "collection": "todos", "id": "1", "fields": {"n": 1}}));
        h.frame(json!({"msg": "added", "collection": "todos", "id": "2", "fields": {"n": 20}}));
        assert!(h.session.collections().ptr_eq(&before));
        assert!(seen.lock().is_empty());

        h.frame(json!({"msg": "ready", "subs": [sub.to_string()]}));
        assert_eq!(*seen.lock(), vec![EventKind::DataUpdated, EventKind::Restored]);

        let after = h.session.collections();
        let (Some(kept), Some(old)) = (after.document("todos", "1"), before.document("todos", "1")) else {
            panic!("document 1 missing");
        };
        assert!(Arc::ptr_eq(kept, old));
        assert_eq!(after.document("todos", "2").map(|d| d["n"].clone()), Some(json!(20)));
    }

    #[test]
    fn test_unchanged_restore_emits_no_data_update() {
        let mut h = harness();
        h.connect();
        let sub = h.subscribe("todos");
        h.frame(json!({"msg": "added", "collection": "todos", "id": "1", "fields": {"n": 1}}));
        h.drop_connection();

        let seen = h.record(&[EventKind::DataUpdated, EventKind::Restored]);
        h.reconnect();
        h.frame(json!({"msg": "added", "collection": "todos", "id": "1", "fields": {"n": 1}}));
        h.frame(json!({"msg": "ready", "subs": [sub.to_string()]}));

        assert_eq!(*seen.lock(), vec![EventKind::Restored]);
    }

    #[test]
    fn test_close_schedules_reconnect_unless_disconnected() {
        let mut h = harness();
        h.connect();
        h.drop_connection();
        assert_eq!(
            h.session.take_effects(),
            vec![Effect::ScheduleReconnect(Duration::from_millis(50))]
        );

        h.reconnect();
        h.session.disconnect();
        h.drop_connection();
        assert_eq!(h.session.take_effects(), vec![Effect::CancelReconnect]);
        assert_eq!(h.server.closes(), 1);
    }

    #[test]
    fn test_stale_resume_is_ignored() {
        let mut h = harness();
        h.session.connect();
        h.session.handle_transport_event(TransportEvent::Open);
        h.frame(json!({"msg": "connected"}));
        let stale = h.session.take_effects();

        h.drop_connection();
        h.session.handle_transport_event(TransportEvent::Open);
        h.frame(json!({"msg": "connected"}));

        let seen = h.record(&[EventKind::Connected]);
        for effect in stale {
            if let Effect::ResumeLogin(generation) = effect {
                h.session.finish_resume(generation);
            }
        }
        assert!(seen.lock().is_empty());

        h.settle_resume();
        assert_eq!(*seen.lock(), vec![EventKind::Connected]);
    }

    #[test]
    fn test_validation_rejects_empty_names() {
        let mut h = harness();
        let err = h
            .session
            .call(
                CallId::next(),
                " ".into(),
                vec![],
                CallOptions::new(),
                Box::new(|_: Result<Value>| {}),
            )
            .expect_err("empty method name");
        assert!(matches!(err, Error::Validation { .. }));

        let err = h
            .session
            .subscribe(SubscriptionId::next(), String::new(), vec![], SubscribeOptions::new())
            .expect_err("empty publication name");
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_shutdown_cancels_outstanding_calls() {
        let mut h = harness();
        let (_, outcomes) = h.call("never", CallOptions::new());
        h.session.shutdown();

        assert!(outcomes.lock()[0].as_ref().is_err_and(Error::is_canceled));
        assert_eq!(h.session.pending_call_count(), 0);
    }

    #[test]
    fn test_server_error_frame_emits_error() {
        let mut h = harness();
        h.connect();
        let seen = h.record(&[EventKind::Error]);

        h.frame(json!({"msg": "error", "reason": "Bad request"}));
        assert_eq!(*seen.lock(), vec![EventKind::Error]);
    }
}

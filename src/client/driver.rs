//! Driver task: owns the [`Session`] and serializes every input to it.
//!
//! Inputs come from three sources, multiplexed with `tokio::select!`:
//!
//! | Source | Handling |
//! |--------|----------|
//! | Transport events | [`Session::handle_transport_event`] |
//! | [`Command`]s from client handles | Mapped onto session operations |
//! | Reconnect timer | [`Session::reconnect`] |
//!
//! After every step the session's effects are applied and the shared
//! state read by [`Client`] accessors is refreshed.

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, trace, warn};

use crate::identifiers::{CallId, ListenerId, SubscriptionId};
use crate::session::{
    CallCallback, CallOptions, Collections, ConnectionStatus, Effect, EventKind, Listener,
    Session, SessionEvent, SubscribeOptions,
};
use crate::transport::TransportEvent;

use super::core::{Client, ClientInner};

// ============================================================================
// Command
// ============================================================================

/// Requests from client handles to the driver task.
pub(crate) enum Command {
    /// Open the transport.
    Connect,
    /// Close the transport and stop reconnecting.
    Disconnect,
    /// Issue a method call.
    Call {
        id: CallId,
        name: String,
        params: Vec<Value>,
        options: CallOptions,
        callback: CallCallback,
    },
    /// Register a subscription.
    Subscribe {
        id: SubscriptionId,
        name: String,
        params: Vec<Value>,
        options: SubscribeOptions,
    },
    /// Stop a subscription.
    Unsubscribe(SubscriptionId),
    /// Register an event listener.
    Listen {
        id: ListenerId,
        kind: EventKind,
        once: bool,
        handler: Listener,
    },
    /// Remove an event listener.
    Off(ListenerId),
    /// Emit an event raised outside the engine (login routines).
    Emit(SessionEvent),
    /// Set the logged-in user, acknowledged once visible to accessors.
    SetUser {
        user_id: Option<String>,
        done: oneshot::Sender<()>,
    },
    /// Session resumption finished for the given generation.
    ResumeSettled(u64),
    /// Cancel everything and end the task.
    Shutdown,
}

// ============================================================================
// SharedState
// ============================================================================

/// Engine state mirrored for synchronous accessors.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub status: ConnectionStatus,
    pub user_id: Option<String>,
    pub collections: Collections,
}

// ============================================================================
// Driver
// ============================================================================

pub(crate) struct Driver {
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<RwLock<SharedState>>,
    /// Used to run session resumption; weak so dropped handles end the task.
    client: Weak<ClientInner>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    pub(crate) fn new(
        session: Session,
        commands: mpsc::UnboundedReceiver<Command>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        shared: Arc<RwLock<SharedState>>,
        client: Weak<ClientInner>,
    ) -> Self {
        Self {
            session,
            commands,
            transport_events,
            shared,
            client,
            reconnect: None,
        }
    }

    /// Runs until shutdown or until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                // Socket lifecycle and frames
                event = self.transport_events.recv() => {
                    match event {
                        Some(event) => self.session.handle_transport_event(event),
                        None => {
                            debug!("Transport event channel closed");
                            break;
                        }
                    }
                }

                // Requests from client handles
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) => {
                            debug!("Shutdown command received");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All client handles dropped");
                            break;
                        }
                    }
                }

                // Reconnect timer
                () = wait_for(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.session.reconnect();
                }
            }

            self.apply_effects();
            self.publish();
        }

        self.session.shutdown();
        self.publish();
        debug!("Session driver terminated");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.session.connect(),

            Command::Disconnect => self.session.disconnect(),

            Command::Call {
                id,
                name,
                params,
                options,
                callback,
            } => {
                if let Err(e) = self.session.call(id, name, params, options, callback) {
                    warn!(id = %id, error = %e, "Call rejected");
                }
            }

            Command::Subscribe {
                id,
                name,
                params,
                options,
            } => {
                if let Err(e) = self.session.subscribe(id, name, params, options) {
                    warn!(id = %id, error = %e, "Subscription rejected");
                }
            }

            Command::Unsubscribe(id) => self.session.unsubscribe(id),

            Command::Listen {
                id,
                kind,
                once,
                handler,
            } => {
                if once {
                    self.session.once(id, kind, handler);
                } else {
                    self.session.on(id, kind, handler);
                }
            }

            Command::Off(id) => {
                if !self.session.off(id) {
                    trace!(id = %id, "Listener already removed");
                }
            }

            Command::Emit(event) => self.session.emit(event),

            Command::SetUser { user_id, done } => {
                self.session.set_user_id(user_id);
                self.publish();
                let _ = done.send(());
            }

            Command::ResumeSettled(generation) => self.session.finish_resume(generation),

            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    /// Carries out effects until the session stops producing them.
    fn apply_effects(&mut self) {
        loop {
            let effects = self.session.take_effects();
            if effects.is_empty() {
                return;
            }

            for effect in effects {
                match effect {
                    Effect::ScheduleReconnect(delay) => {
                        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    Effect::CancelReconnect => self.reconnect = None,
                    Effect::ResumeLogin(generation) => self.spawn_resume(generation),
                }
            }
        }
    }

    fn spawn_resume(&mut self, generation: u64) {
        let Some(inner) = self.client.upgrade() else {
            self.session.finish_resume(generation);
            return;
        };
        let client = Client { inner };

        tokio::spawn(async move {
            client.resume().await;
            let _ = client
                .inner
                .commands
                .send(Command::ResumeSettled(generation));
        });
    }

    fn publish(&self) {
        let mut shared = self.shared.write();
        shared.status = self.session.status();
        if shared.user_id.as_deref() != self.session.user_id() {
            shared.user_id = self.session.user_id().map(str::to_owned);
        }
        let collections = self.session.collections();
        if !shared.collections.ptr_eq(collections) {
            shared.collections = collections.clone();
        }
    }
}

/// Resolves when the timer fires; pending forever without one.
async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

//! WebSocket client transport.
//!
//! Each [`Transport::open`] spawns one tokio task that owns the socket for
//! the lifetime of that connection.
//!
//! # Connection Task
//!
//! The task handles:
//!
//! - The client handshake (`connect_async`)
//! - Incoming text frames, forwarded as [`TransportEvent::Message`]
//! - Outgoing frames queued by [`Transport::send`]
//! - Shutdown requested by [`Transport::close`]
//!
//! It always ends by emitting [`TransportEvent::Close`], including when the
//! handshake itself fails.

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::{Transport, TransportEvent, TransportEvents};

// ============================================================================
// Outgoing
// ============================================================================

/// Internal commands for the connection task.
enum Outgoing {
    /// Write a text frame.
    Text(String),
    /// Close the socket and end the task.
    Shutdown,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// [`Transport`] over a WebSocket client connection.
///
/// # Example
///
/// ```ignore
/// use ddp_session::transport::WebSocketTransport;
///
/// let transport = WebSocketTransport::new("ws://localhost:3000/websocket");
/// ```
#[derive(Debug)]
pub struct WebSocketTransport {
    /// Server URL (`ws://` or `wss://`).
    url: String,
    /// Channel to the live connection task, if any.
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
}

impl WebSocketTransport {
    /// Creates a transport for `url`. Nothing connects until `open`.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outgoing: None,
        }
    }

    /// Returns the server URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns `true` while a connection task is running.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Connection task: handshake, then pump frames both ways.
    async fn run_connection(
        url: String,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
        events: TransportEvents,
    ) {
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                warn!(url = %url, error = %e, "WebSocket connect failed");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                let _ = events.send(TransportEvent::Close);
                return;
            }
        };

        info!(url = %url, "WebSocket connection established");
        let _ = events.send(TransportEvent::Open);

        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from the server
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if events.send(TransportEvent::Message(text.to_string())).is_err() {
                                debug!("Session engine gone, dropping connection");
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong, Frame
                        _ => {}
                    }
                }

                // Frames from the session engine
                command = outgoing_rx.recv() => {
                    match command {
                        Some(Outgoing::Text(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "Failed to send frame");
                                let _ = events.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }

                        Some(Outgoing::Shutdown) | None => {
                            debug!("Shutdown requested");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        let _ = events.send(TransportEvent::Close);
        debug!(url = %url, "Connection task terminated");
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, events: TransportEvents) {
        if self.is_active() {
            debug!(url = %self.url, "Transport already open");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);
        tokio::spawn(Self::run_connection(self.url.clone(), rx, events));
    }

    fn close(&mut self) {
        // `is_active` stays true until the task has emitted Close
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(Outgoing::Shutdown);
        }
    }

    fn send(&mut self, text: String) {
        let sent = self
            .outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(Outgoing::Text(text)).is_ok());
        if !sent {
            trace!("Dropping frame, transport closed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

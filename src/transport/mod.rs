//! Transport adapter layer.
//!
//! The session engine talks to the server through a [`Transport`]: a duplex
//! text channel that can be opened, closed and written to, and that reports
//! what happens to it as [`TransportEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   open/close/send   ┌─────────────────┐
//! │  Session engine │────────────────────►│   Transport     │◄──── server
//! │                 │◄────────────────────│  (WebSocket)    │────►
//! └─────────────────┘   TransportEvent    └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | Default tokio-tungstenite adapter |

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket client transport.
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Types
// ============================================================================

/// What happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established.
    Open,
    /// Text frame received.
    Message(String),
    /// Connection closed, lost, or failed to open.
    Close,
    /// Non-fatal transport failure worth reporting.
    Error(String),
}

/// Sink for transport events, handed to [`Transport::open`].
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// Transport
// ============================================================================

/// Duplex text channel to a DDP server.
///
/// Implementations must report exactly one [`TransportEvent::Close`] for
/// every `open` attempt, whether the attempt failed or the established
/// connection later ended.
pub trait Transport: Send + 'static {
    /// Starts connecting. Events for this connection go to `events`.
    ///
    /// Calling `open` while a connection is alive is a no-op. A connection
    /// that was asked to `close` stays alive until it reports `Close`.
    fn open(&mut self, events: TransportEvents);

    /// Closes the current connection, if any.
    fn close(&mut self);

    /// Writes a text frame. Frames written while closed are dropped.
    fn send(&mut self, text: String);
}

// ============================================================================
// Re-exports
// ============================================================================

pub use websocket::WebSocketTransport;

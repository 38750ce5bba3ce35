//! DDP Session - pub/sub and RPC client for DDP servers.
//!
//! This library keeps one logical session with a DDP server across any
//! number of physical connections: calls are queued, retried or canceled
//! across reconnects, subscriptions are restored, and a local mirror of the
//! published collections is maintained as immutable snapshots.
//!
//! # Architecture
//!
//! The client follows a handle/driver model:
//!
//! - **Session engine**: synchronous state machine owning all protocol state
//! - **Driver task**: owns the engine, feeds it transport events, commands and timers
//! - **Client handle**: cheap clone forwarding operations to the driver
//! - **Transport**: pluggable duplex text channel (WebSocket by default)
//!
//! Key design principles:
//!
//! - Calls complete only once their result arrived *and* their writes are visible
//! - A `wait` call holds back everything queued after it
//! - Collections are never mutated in place; every change yields a new snapshot
//! - After a reconnect, consumers keep seeing the old snapshot until restored
//!
//! # Quick Start
//!
//! ```no_run
//! use ddp_session::{Client, EventKind, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder("ws://localhost:3000/websocket")
//!         .collection("todos")
//!         .build()?;
//!
//!     client.on(EventKind::DataUpdated, |event| println!("{event:?}"));
//!
//!     let todos = client.subscribe("todos", vec![])?;
//!     let id = client.call("todos.insert", vec![json!({"text": "milk"})]).await?;
//!     println!("Inserted {id}");
//!
//!     todos.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] handle and [`ClientBuilder`] |
//! | [`config`] | Session settings |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | DDP wire frames |
//! | [`session`] | Calls, subscriptions, collections, events |
//! | [`storage`] | Login token persistence |
//! | [`transport`] | Transport trait and WebSocket adapter |
//!
//! # Features
//!
//! - **tls**: `wss://` endpoints through `native-tls`

// ============================================================================
// Modules
// ============================================================================

/// Client handle, builder and login routines.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Session settings.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for calls, subscriptions and listeners.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// DDP wire message types.
pub mod protocol;

/// Session engine types: calls, subscriptions, collections and events.
pub mod session;

/// Login token persistence.
pub mod storage;

/// Transport layer.
///
/// Defines the [`Transport`](transport::Transport) seam and the default
/// WebSocket adapter.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder, SubscriptionHandle};

// Configuration types
pub use config::{LogoutFailure, SessionConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CallId, ListenerId, SubscriptionId};

// Session types
pub use session::{
    CallOptions, Collections, ConnectionStatus, Document, EventKind, SessionEvent,
    SubscribeOptions, Transforms,
};

// Collaborator types
pub use storage::{MemoryStorage, Storage};
pub use transport::{Transport, TransportEvent, WebSocketTransport};

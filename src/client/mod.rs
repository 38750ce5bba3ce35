//! Async client for a DDP session.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Cloneable handle: calls, subscriptions, events, login |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`SubscriptionHandle`] | Stops one subscription |
//!
//! # Example
//!
//! ```ignore
//! use ddp_session::{Client, EventKind};
//! use serde_json::json;
//!
//! # async fn example() -> ddp_session::Result<()> {
//! let client = Client::builder("ws://localhost:3000/websocket")
//!     .collection("todos")
//!     .build()?;
//!
//! client.on(EventKind::DataUpdated, |event| println!("{event:?}"));
//! client.login(json!({"user": {"username": "alice"}, "password": "secret"})).await?;
//!
//! let todos = client.subscribe("todos", vec![])?;
//! client.call("todos.insert", vec![json!({"text": "milk"})]).await?;
//! todos.stop();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Login, logout and session resumption.
mod auth;

/// Fluent builder for client configuration.
pub mod builder;

/// Client handle.
pub mod core;

/// Driver task owning the session engine.
mod driver;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use core::{Client, SubscriptionHandle};

// ============================================================================
// Tests
// ============================================================================

//! DDP wire message types.
//!
//! This module defines the JSON frames exchanged between the client and a
//! DDP server over the transport.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `connect` | Client → Server | Handshake and version negotiation |
//! | `connected` | Server → Client | Handshake accepted |
//! | `ping` / `pong` | Both | Keep-alive |
//! | `method` / `result` / `updated` | Both | Remote method calls |
//! | `sub` / `unsub` / `ready` / `nosub` | Both | Subscriptions |
//! | `added` / `changed` / `removed` | Server → Client | Collection data |
//! | `error` | Server → Client | Malformed client frame |
//!
//! Every frame is a JSON object tagged by its `msg` field.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `outgoing` | Frames the client sends |
//! | `incoming` | Frames the server sends |

// ============================================================================
// Submodules
// ============================================================================

/// Client to server frames.
pub mod outgoing;

/// Server to client frames.
pub mod incoming;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version offered in the `connect` handshake.
pub const DDP_VERSION: &str = "1";

// ============================================================================
// Re-exports
// ============================================================================

pub use incoming::{ServerError, ServerMessage};
pub use outgoing::ClientMessage;

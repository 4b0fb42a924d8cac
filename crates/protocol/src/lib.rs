//! Gangway Protocol
//!
//! Shared types for communication between the Gangway session host and its
//! clients. Text frames are serialized as JSON over WebSocket; binary frames
//! use the codec in [`frames`].

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod debug;
pub mod frames;
pub mod probe;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use debug::DebugMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short display form of a session id (first 8 characters).
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

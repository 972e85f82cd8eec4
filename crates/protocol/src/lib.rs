//! Threadbridge Protocol
//!
//! Shared types for communication between the threadbridge client core and
//! the remote thread authority. These types are serialized as JSON over the
//! transport; the `type` tag plus optional `correlation_id` form the message
//! envelope the reconciliation logic keys on.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

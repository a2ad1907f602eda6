//! Protocol module for coordinator communication
//!
//! Defines the message types and serialization for the executor-coordinator
//! protocol. Messages are JSON documents carried over WebSocket; binary
//! fields are base64 encoded.

mod messages;
mod version;

pub use messages::*;
pub use version::*;

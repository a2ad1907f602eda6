//! Coordinator communication
//!
//! The WebSocket client registers the executor, turns inbound launch, kill
//! and stop requests into events, and carries the executor's status
//! updates and heartbeats back to the coordinator.

mod client;

pub use client::*;

//! Task executor module
//!
//! Handles the task execution lifecycle:
//! - Receiving launch and kill requests from the coordinator
//! - Resolving task dependencies and running task bodies
//! - Routing results by size and classifying failures
//! - Reporting status and heartbeats

mod backend;
mod block;
mod builtin;
mod dependency;
mod failure;
mod heartbeat;
mod memory;
mod registry;
mod result;
mod runner;
mod service;
mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::*;
pub use block::*;
pub use builtin::*;
pub use dependency::*;
pub use failure::*;
pub use heartbeat::*;
pub use memory::*;
pub use registry::TaskRegistry;
pub use result::*;
pub use runner::{RunnerState, TaskRunner};
pub use service::*;
pub use task::*;

//! The executor's view of its coordinator

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{BlockStoreId, HeartbeatRequest, HeartbeatResponse, TaskState};

/// Outbound channel to the coordinator
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Report a task state change with its serialized payload
    async fn status_update(&self, task_id: i64, state: TaskState, data: Vec<u8>) -> Result<()>;

    /// Send a heartbeat and wait for the coordinator's answer
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Announce the block store again after the coordinator lost track of it
    async fn register_block_store(&self, block_store_id: &BlockStoreId) -> Result<()>;
}

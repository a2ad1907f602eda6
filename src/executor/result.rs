//! Result packaging and routing
//!
//! A finished task's value is wrapped in a [`DirectTaskResult`], serialized,
//! and then routed by its serialized size `S`:
//!
//! - `max_result_size > 0 && S > max_result_size`: dropped, only the size is reported
//! - `S >= max_direct_result_size`: written to the block store, a reference is reported
//! - otherwise: sent inline

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::protocol::{base64_bytes, TaskMetrics};

use super::block::{task_result_block_id, BlockStore, StorageLevel};

/// How a serialized result reaches the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultRoute {
    Direct,
    BlockStore,
    Dropped,
}

/// Pick the route for a result of `size` serialized bytes.
///
/// A `max_result_size` of 0 disables the drop cap.
pub fn route_result(size: u64, max_result_size: u64, max_direct_result_size: u64) -> ResultRoute {
    if max_result_size > 0 && size > max_result_size {
        ResultRoute::Dropped
    } else if size >= max_direct_result_size {
        ResultRoute::BlockStore
    } else {
        ResultRoute::Direct
    }
}

/// Task value together with the accumulator updates and metrics of the attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectTaskResult {
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub accumulators: BTreeMap<String, i64>,
    pub metrics: TaskMetrics,
}

/// Reference to a result that was not sent inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectTaskResult {
    pub block_id: String,
    pub size: u64,
    /// The result exceeded the size cap and was never stored
    #[serde(default)]
    pub dropped: bool,
}

/// Payload of a FINISHED status update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Direct(DirectTaskResult),
    Indirect(IndirectTaskResult),
}

impl TaskResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A routed result plus the figures the runner records in task metrics
#[derive(Debug)]
pub struct PackagedResult {
    pub route: ResultRoute,
    pub bytes: Vec<u8>,
    pub size: u64,
    pub serialization_time_ms: u64,
}

/// Serializes and routes finished task values
#[derive(Clone)]
pub struct ResultPackager {
    max_result_size: u64,
    max_direct_result_size: u64,
    block_store: Arc<dyn BlockStore>,
}

impl ResultPackager {
    pub fn new(
        max_result_size: u64,
        max_direct_result_size: u64,
        block_store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            max_result_size,
            max_direct_result_size,
            block_store,
        }
    }

    /// Serialize `result`, route it by size and build the status payload.
    ///
    /// The measured size and serialization time are written into the
    /// result's metrics before the payload is built.
    pub fn package(&self, task_id: i64, mut result: DirectTaskResult) -> Result<PackagedResult> {
        let started = Instant::now();
        let size = serde_json::to_vec(&result)?.len() as u64;
        let serialization_time_ms = started.elapsed().as_millis() as u64;
        result.metrics.result_size = size;
        result.metrics.result_serialization_time_ms = serialization_time_ms;
        let block_id = task_result_block_id(task_id);

        let route = route_result(size, self.max_result_size, self.max_direct_result_size);
        let payload = match route {
            ResultRoute::Dropped => {
                warn!(
                    task_id,
                    size,
                    max_result_size = self.max_result_size,
                    "Result larger than the maximum result size, dropping it"
                );
                TaskResult::Indirect(IndirectTaskResult {
                    block_id,
                    size,
                    dropped: true,
                })
            }
            ResultRoute::BlockStore => {
                let serialized = serde_json::to_vec(&result)?;
                let stored_size = serialized.len() as u64;
                // kept until the coordinator removes it or the task is relaunched
                self.block_store
                    .put(&block_id, serialized, StorageLevel::DiskOnly)?;
                info!(task_id, size = stored_size, block_id = %block_id, "Result sent via block store");
                TaskResult::Indirect(IndirectTaskResult {
                    block_id,
                    size: stored_size,
                    dropped: false,
                })
            }
            ResultRoute::Direct => {
                info!(task_id, size, "Result sent directly");
                TaskResult::Direct(result)
            }
        };

        Ok(PackagedResult {
            route,
            bytes: payload.to_bytes()?,
            size,
            serialization_time_ms,
        })
    }
}

//! Protocol message definitions
//!
//! All message types for executor-coordinator communication.
//! Messages are serialized as JSON with a type discriminator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolVersion;

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version
    pub version: ProtocolVersion,

    /// ID of the request this message answers, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            reply_to: None,
            payload,
        }
    }

    /// Create an envelope answering another message
    pub fn reply(payload: Message, reply_to: Uuid) -> Self {
        Self {
            reply_to: Some(reply_to),
            ..Self::new(payload)
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Executor → Coordinator ─────────────────────────────────
    /// Executor registration request
    RegisterExecutor(RegisterExecutorRequest),

    /// Task state change
    StatusUpdate(StatusUpdateMessage),

    /// Liveness report with per-task metrics
    Heartbeat(HeartbeatRequest),

    /// Re-announce the local block store
    RegisterBlockStore(RegisterBlockStoreMessage),

    /// Executor is going away
    ExecutorShutdown(ExecutorShutdownMessage),

    // ─── Coordinator → Executor ─────────────────────────────────
    /// Registration acknowledgment
    RegisteredExecutor(RegisteredExecutorResponse),

    /// Run a task attempt
    LaunchTask(LaunchTaskMessage),

    /// Cancel a task attempt
    KillTask(KillTaskMessage),

    /// Answer to a heartbeat
    HeartbeatResponse(HeartbeatResponse),

    /// A stored block was fetched or is no longer needed
    RemoveBlock(RemoveBlockMessage),

    /// Orderly shutdown request
    StopExecutor(StopExecutorMessage),

    /// Error response
    Error(ErrorMessage),
}

impl Message {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RegisterExecutor(_) => "REGISTER_EXECUTOR",
            Message::StatusUpdate(_) => "STATUS_UPDATE",
            Message::Heartbeat(_) => "HEARTBEAT",
            Message::RegisterBlockStore(_) => "REGISTER_BLOCK_STORE",
            Message::ExecutorShutdown(_) => "EXECUTOR_SHUTDOWN",
            Message::RegisteredExecutor(_) => "REGISTERED_EXECUTOR",
            Message::LaunchTask(_) => "LAUNCH_TASK",
            Message::KillTask(_) => "KILL_TASK",
            Message::HeartbeatResponse(_) => "HEARTBEAT_RESPONSE",
            Message::RemoveBlock(_) => "REMOVE_BLOCK",
            Message::StopExecutor(_) => "STOP_EXECUTOR",
            Message::Error(_) => "ERROR",
        }
    }

    /// Check if this is a request message (executor → coordinator)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::RegisterExecutor(_)
                | Message::StatusUpdate(_)
                | Message::Heartbeat(_)
                | Message::RegisterBlockStore(_)
                | Message::ExecutorShutdown(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Registration Messages
// ─────────────────────────────────────────────────────────────────

/// Identity of a block store as known to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockStoreId {
    pub executor_id: String,
    pub host: String,
}

impl std::fmt::Display for BlockStoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockStore({}, {})", self.executor_id, self.host)
    }
}

/// Executor registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterExecutorRequest {
    pub executor_id: String,
    pub hostname: String,
    pub cores: u32,
    pub block_store_id: BlockStoreId,
}

/// Registration acknowledgment from coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredExecutorResponse {
    pub success: bool,

    /// Coordinator's protocol version
    #[serde(default)]
    pub coordinator_version: ProtocolVersion,

    #[serde(default)]
    pub error: Option<String>,
}

/// Block store re-registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockStoreMessage {
    pub block_store_id: BlockStoreId,
}

/// Executor shutdown notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorShutdownMessage {
    pub executor_id: String,
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────
// Task Messages
// ─────────────────────────────────────────────────────────────────

/// Task states reported to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Finished,
    Failed,
    Killed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Task launch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTaskMessage {
    pub task_id: i64,
    pub attempt_number: i32,
    pub name: String,

    /// Serialized task description
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Task kill request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillTaskMessage {
    pub task_id: i64,

    /// Also wake the task out of interruptible waits
    #[serde(default)]
    pub interrupt_thread: bool,

    #[serde(default = "default_kill_reason")]
    pub reason: String,
}

fn default_kill_reason() -> String {
    "killed by coordinator".to_string()
}

/// Task state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    pub task_id: i64,
    pub state: TaskState,

    /// Serialized result (FINISHED) or failure reason (FAILED/KILLED)
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Task execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Time spent decoding the task and resolving dependencies (ms)
    pub deserialize_time_ms: u64,

    /// Time spent in the task body (ms)
    pub run_time_ms: u64,

    /// Time spent encoding the result (ms)
    pub result_serialization_time_ms: u64,

    /// Serialized result size in bytes
    pub result_size: u64,

    /// Largest tracked allocation total observed
    pub peak_tracked_memory_bytes: u64,

    /// Tracked bytes still outstanding at teardown
    pub leaked_memory_bytes: u64,
}

/// Metrics of one running task, as carried by a heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetricsSnapshot {
    pub task_id: i64,
    pub attempt_number: i32,
    pub metrics: TaskMetrics,

    #[serde(default)]
    pub accumulators: BTreeMap<String, i64>,
}

// ─────────────────────────────────────────────────────────────────
// Heartbeat Messages
// ─────────────────────────────────────────────────────────────────

/// Heartbeat request from executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub executor_id: String,
    pub task_metrics: Vec<TaskMetricsSnapshot>,
    pub block_store_id: BlockStoreId,
}

/// Heartbeat answer from coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// The coordinator no longer knows our block store
    #[serde(default)]
    pub reregister_block_manager: bool,
}

/// Drop a block from the local block store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBlockMessage {
    pub block_id: String,
}

/// Orderly shutdown request from coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopExecutorMessage {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Error message from coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,

    /// Whether the error is fatal (connection should be closed)
    #[serde(default)]
    pub fatal: bool,
}

/// Serde adapter carrying byte vectors as base64 strings
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

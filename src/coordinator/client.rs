//! WebSocket client for coordinator communication
//!
//! Provides a robust WebSocket client with:
//! - Automatic reconnection with exponential backoff
//! - Registration with a protocol version check
//! - Heartbeat requests correlated with their responses
//!
//! The client is also the executor's [`ExecutorBackend`]: status updates,
//! heartbeats and block store registrations go out through its command
//! channel. Nothing is queued while the connection is down; those sends
//! fail with a connection error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{CoordinatorSettings, ExecutorSettings};
use crate::error::{Error, Result};
use crate::executor::ExecutorBackend;
use crate::protocol::{
    BlockStoreId, ExecutorShutdownMessage, HeartbeatRequest, HeartbeatResponse,
    KillTaskMessage, LaunchTaskMessage, Message, MessageEnvelope, ProtocolVersion,
    RegisterBlockStoreMessage, RegisterExecutorRequest, RegisteredExecutorResponse,
    StatusUpdateMessage, TaskState, PROTOCOL_VERSION,
};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the coordinator client
#[derive(Debug, Clone)]
pub struct CoordinatorClientConfig {
    /// WebSocket URL of the coordinator
    pub url: String,

    /// Connection and registration timeout
    pub connect_timeout: Duration,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// How long a heartbeat waits for its response
    pub heartbeat_timeout: Duration,

    /// Message queue size
    pub message_queue_size: usize,
}

impl Default for CoordinatorClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7077".to_string(),
            connect_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
            message_queue_size: 100,
        }
    }
}

impl CoordinatorClientConfig {
    /// Build the client configuration from the executor configuration file
    pub fn from_settings(coordinator: &CoordinatorSettings, executor: &ExecutorSettings) -> Self {
        let initial = Duration::from_millis(coordinator.reconnect_interval_ms);
        Self {
            url: coordinator.url.clone(),
            connect_timeout: Duration::from_millis(coordinator.connect_timeout_ms),
            max_reconnect_attempts: coordinator.max_reconnect_attempts,
            initial_reconnect_delay: initial,
            max_reconnect_delay: Duration::from_millis(coordinator.max_reconnect_interval_ms).max(initial),
            heartbeat_timeout: executor.heartbeat_timeout(),
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected but not registered
    Connected,
    /// Registered and ready
    Registered,
    /// Connection error, will retry
    Reconnecting,
    /// Shutting down
    ShuttingDown,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Internal client state
#[derive(Debug, Default)]
struct ClientState {
    /// Current connection state
    connection_state: ConnectionState,

    /// Last heartbeat response time
    last_heartbeat: Option<Instant>,

    /// Reconnection attempt count
    reconnect_attempts: u32,

    /// When the current connection was established
    connected_at: Option<Instant>,
}

/// Heartbeats waiting for their response, keyed by request id
type PendingReplies = Arc<Mutex<HashMap<Uuid, oneshot::Sender<HeartbeatResponse>>>>;

// ─────────────────────────────────────────────────────────────────
// Commands and Events
// ─────────────────────────────────────────────────────────────────

/// Commands that can be sent to the client
#[derive(Debug)]
pub enum ClientCommand {
    /// Send a message to the coordinator
    Send(MessageEnvelope),

    /// Announce shutdown and close the connection
    Shutdown { reason: String },
}

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connected to coordinator
    Connected,

    /// Registration accepted
    Registered { executor_id: String },

    /// Coordinator asked to run a task
    LaunchTask(LaunchTaskMessage),

    /// Coordinator asked to kill a task
    KillTask(KillTaskMessage),

    /// Coordinator no longer needs a stored block
    RemoveBlock { block_id: String },

    /// Coordinator asked this executor to stop
    StopExecutor { reason: Option<String> },

    /// Disconnected from coordinator
    Disconnected { reason: String },

    /// Reconnecting to coordinator
    Reconnecting { attempt: u32 },

    /// Error occurred
    Error { message: String, fatal: bool },
}

// ─────────────────────────────────────────────────────────────────
// Coordinator Client
// ─────────────────────────────────────────────────────────────────

/// WebSocket client for coordinator communication
pub struct CoordinatorClient {
    config: CoordinatorClientConfig,
    registration: RegisterExecutorRequest,
    state: Arc<RwLock<ClientState>>,
    pending: PendingReplies,
    command_tx: mpsc::Sender<ClientCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<ClientCommand>>>,
}

impl CoordinatorClient {
    /// Create a new coordinator client
    pub fn new(config: CoordinatorClientConfig, registration: RegisterExecutorRequest) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.message_queue_size);

        Self {
            config,
            registration,
            state: Arc::new(RwLock::new(ClientState::default())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    /// Start the client and return the event receiver.
    ///
    /// The client runs until shutdown, a fatal error, or the reconnect
    /// limit; the event channel closes when it stops.
    pub fn start(&self) -> Result<mpsc::Receiver<ClientEvent>> {
        let command_rx = self
            .command_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("coordinator client already started".to_string()))?;
        let (event_tx, event_rx) = mpsc::channel(self.config.message_queue_size);

        let client_loop = ClientLoop {
            config: self.config.clone(),
            registration: self.registration.clone(),
            state: self.state.clone(),
            pending: self.pending.clone(),
            event_tx,
        };
        tokio::spawn(client_loop.run(command_rx));

        Ok(event_rx)
    }

    /// Send a command to the client
    pub async fn send_command(&self, command: ClientCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::Connection("Client channel closed".to_string()))
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Check if connected and registered
    pub fn is_ready(&self) -> bool {
        self.state.read().connection_state == ConnectionState::Registered
    }

    /// Time since the last heartbeat response
    pub fn since_last_heartbeat(&self) -> Option<Duration> {
        self.state.read().last_heartbeat.map(|t| t.elapsed())
    }

    pub fn executor_id(&self) -> &str {
        &self.registration.executor_id
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self, reason: impl Into<String>) -> Result<()> {
        self.send_command(ClientCommand::Shutdown { reason: reason.into() }).await
    }

    fn ensure_ready(&self, message_type: &str) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "cannot send {}: not registered with coordinator ({:?})",
                message_type,
                self.connection_state()
            )))
        }
    }

    async fn send_payload(&self, payload: Message) -> Result<()> {
        self.ensure_ready(payload.type_name())?;
        self.send_command(ClientCommand::Send(MessageEnvelope::new(payload))).await
    }
}

#[async_trait]
impl ExecutorBackend for CoordinatorClient {
    async fn status_update(&self, task_id: i64, state: TaskState, data: Vec<u8>) -> Result<()> {
        self.send_payload(Message::StatusUpdate(StatusUpdateMessage { task_id, state, data }))
            .await
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let envelope = MessageEnvelope::new(Message::Heartbeat(request));
        self.ensure_ready(envelope.payload.type_name())?;

        let id = envelope.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        if let Err(e) = self.send_command(ClientCommand::Send(envelope)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.heartbeat_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Connection(
                "Connection lost before heartbeat response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::ConnectionTimeout {
                    target: "heartbeat".to_string(),
                    timeout_ms: self.config.heartbeat_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn register_block_store(&self, block_store_id: &BlockStoreId) -> Result<()> {
        self.send_payload(Message::RegisterBlockStore(RegisterBlockStoreMessage {
            block_store_id: block_store_id.clone(),
        }))
        .await
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Loop
// ─────────────────────────────────────────────────────────────────

struct ClientLoop {
    config: CoordinatorClientConfig,
    registration: RegisterExecutorRequest,
    state: Arc<RwLock<ClientState>>,
    pending: PendingReplies,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl ClientLoop {
    /// Main client loop with reconnection logic
    async fn run(self, mut command_rx: mpsc::Receiver<ClientCommand>) {
        let url = match Url::parse(&self.config.url) {
            Ok(u) => u,
            Err(e) => {
                error!(url = %self.config.url, error = %e, "Invalid coordinator URL");
                self.emit(ClientEvent::Error {
                    message: format!("Invalid URL: {}", e),
                    fatal: true,
                })
                .await;
                return;
            }
        };

        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_reconnect_delay,
            max_interval: self.config.max_reconnect_delay,
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        };

        'client: loop {
            if self.connection_state() == ConnectionState::ShuttingDown {
                info!("Client shutdown requested");
                break;
            }

            self.set_connection_state(ConnectionState::Connecting);
            info!(url = %url, "Connecting to coordinator");

            match tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws_stream, _response))) => {
                    info!("WebSocket connection established");

                    backoff.reset();
                    {
                        let mut s = self.state.write();
                        s.connection_state = ConnectionState::Connected;
                        s.connected_at = Some(Instant::now());
                        s.reconnect_attempts = 0;
                    }
                    self.emit(ClientEvent::Connected).await;

                    let (write, read) = ws_stream.split();
                    let result = self.handle_connection(&mut command_rx, write, read).await;

                    // waiting heartbeats see their sender dropped
                    self.pending.lock().clear();

                    if self.connection_state() == ConnectionState::ShuttingDown {
                        break;
                    }
                    self.set_connection_state(ConnectionState::Reconnecting);

                    match result {
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Fatal coordinator error");
                            self.emit(ClientEvent::Error {
                                message: e.to_string(),
                                fatal: true,
                            })
                            .await;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Connection error");
                            self.emit(ClientEvent::Disconnected { reason: e.to_string() }).await;
                        }
                        Ok(()) => {
                            self.emit(ClientEvent::Disconnected {
                                reason: "Connection closed by coordinator".to_string(),
                            })
                            .await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to connect to coordinator");
                    self.emit(ClientEvent::Error {
                        message: format!("Connection failed: {}", e),
                        fatal: false,
                    })
                    .await;
                }
                Err(_) => {
                    error!(
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "Timed out connecting to coordinator"
                    );
                    self.emit(ClientEvent::Error {
                        message: "Connection timed out".to_string(),
                        fatal: false,
                    })
                    .await;
                }
            }

            let attempts = {
                let mut s = self.state.write();
                s.connection_state = ConnectionState::Reconnecting;
                s.connected_at = None;
                s.reconnect_attempts += 1;
                s.reconnect_attempts
            };

            if self.config.max_reconnect_attempts > 0 && attempts >= self.config.max_reconnect_attempts {
                error!(
                    attempts = attempts,
                    max = self.config.max_reconnect_attempts,
                    "Max reconnection attempts reached"
                );
                self.emit(ClientEvent::Error {
                    message: "Max reconnection attempts reached".to_string(),
                    fatal: true,
                })
                .await;
                break;
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.max_reconnect_delay);
            self.emit(ClientEvent::Reconnecting { attempt: attempts }).await;
            info!(delay_ms = delay.as_millis() as u64, attempt = attempts, "Waiting before reconnection");

            let wait = tokio::time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    cmd = command_rx.recv() => match cmd {
                        Some(ClientCommand::Send(envelope)) => {
                            warn!(message_type = %envelope.payload.type_name(), "Dropping message while disconnected");
                        }
                        Some(ClientCommand::Shutdown { .. }) | None => {
                            self.set_connection_state(ConnectionState::ShuttingDown);
                            break 'client;
                        }
                    },
                }
            }
        }

        self.pending.lock().clear();
        self.set_connection_state(ConnectionState::Disconnected);
        info!("Client loop terminated");
    }

    /// Handle an active WebSocket connection
    async fn handle_connection<S, R>(
        &self,
        command_rx: &mut mpsc::Receiver<ClientCommand>,
        mut write: S,
        mut read: R,
    ) -> Result<()>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
        R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        let register = MessageEnvelope::new(Message::RegisterExecutor(self.registration.clone()));
        send_envelope(&mut write, &register).await?;
        debug!("Sent registration request");

        self.wait_for_registration(&mut read).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => match MessageEnvelope::from_json(&text) {
                            Ok(envelope) => self.handle_incoming_message(envelope).await,
                            Err(e) => warn!(error = %e, "Failed to parse message"),
                        },
                        Some(Ok(WsMessage::Binary(data))) => match MessageEnvelope::from_json_bytes(&data) {
                            Ok(envelope) => self.handle_incoming_message(envelope).await,
                            Err(e) => warn!(error = %e, "Failed to parse binary message"),
                        },
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(frame = ?frame, "Received close frame");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            return Err(Error::Connection(e.to_string()));
                        }
                        None => {
                            info!("WebSocket stream ended");
                            return Ok(());
                        }
                    }
                }

                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Send(envelope)) => {
                            send_envelope(&mut write, &envelope).await?;
                        }
                        Some(ClientCommand::Shutdown { reason }) => {
                            info!(reason = %reason, "Shutdown command received");
                            let notice = MessageEnvelope::new(Message::ExecutorShutdown(ExecutorShutdownMessage {
                                executor_id: self.registration.executor_id.clone(),
                                reason,
                            }));
                            let _ = send_envelope(&mut write, &notice).await;
                            let _ = write.send(WsMessage::Close(None)).await;
                            self.set_connection_state(ConnectionState::ShuttingDown);
                            return Ok(());
                        }
                        None => {
                            info!("Command channel closed");
                            self.set_connection_state(ConnectionState::ShuttingDown);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Wait for the registration answer and check it
    async fn wait_for_registration<R>(&self, read: &mut R) -> Result<()>
    where
        R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        let timeout = self.config.connect_timeout;
        let (version, ack) = tokio::time::timeout(timeout, async {
            while let Some(msg) = read.next().await {
                let parsed = match msg {
                    Ok(WsMessage::Text(text)) => MessageEnvelope::from_json(&text),
                    Ok(WsMessage::Binary(data)) => MessageEnvelope::from_json_bytes(&data),
                    Ok(WsMessage::Close(_)) => {
                        return Err(Error::Connection("Connection closed during registration".to_string()));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(Error::Connection(e.to_string())),
                };
                let envelope = match parsed {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Failed to parse message during registration");
                        continue;
                    }
                };

                let version = envelope.version;
                match envelope.payload {
                    Message::RegisteredExecutor(ack) => return Ok((version, ack)),
                    Message::Error(err) => {
                        return Err(Error::RegistrationRejected { message: err.message });
                    }
                    other => {
                        debug!(message_type = %other.type_name(), "Ignoring message before registration");
                    }
                }
            }
            Err(Error::Connection("Stream ended during registration".to_string()))
        })
        .await
        .map_err(|_| Error::ConnectionTimeout {
            target: "registration".to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

        self.accept_registration(version, ack).await
    }

    async fn accept_registration(
        &self,
        version: ProtocolVersion,
        ack: RegisteredExecutorResponse,
    ) -> Result<()> {
        if !PROTOCOL_VERSION.is_compatible_with(&version) {
            return Err(Error::ProtocolVersion {
                expected: PROTOCOL_VERSION.to_string(),
                actual: version.to_string(),
            });
        }

        if !ack.success {
            let message = ack.error.unwrap_or_else(|| "Unknown error".to_string());
            error!(error = %message, "Registration failed");
            return Err(Error::RegistrationRejected { message });
        }

        self.set_connection_state(ConnectionState::Registered);
        let executor_id = self.registration.executor_id.clone();
        info!(
            executor_id = %executor_id,
            coordinator_version = %ack.coordinator_version,
            "Registration successful"
        );
        self.emit(ClientEvent::Registered { executor_id }).await;
        Ok(())
    }

    /// Handle incoming message from coordinator
    async fn handle_incoming_message(&self, envelope: MessageEnvelope) {
        debug!(message_type = %envelope.payload.type_name(), "Received message");

        match envelope.payload {
            Message::LaunchTask(launch) => {
                debug!(task_id = launch.task_id, attempt = launch.attempt_number, "Received launch request");
                self.emit(ClientEvent::LaunchTask(launch)).await;
            }

            Message::KillTask(kill) => {
                info!(task_id = kill.task_id, reason = %kill.reason, "Received kill request");
                self.emit(ClientEvent::KillTask(kill)).await;
            }

            Message::HeartbeatResponse(response) => {
                self.state.write().last_heartbeat = Some(Instant::now());
                let waiter = envelope.reply_to.and_then(|id| self.pending.lock().remove(&id));
                match waiter {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(response);
                    }
                    None => debug!(reply_to = ?envelope.reply_to, "Heartbeat response matches no pending request"),
                }
            }

            Message::RemoveBlock(remove) => {
                debug!(block_id = %remove.block_id, "Received block removal");
                self.emit(ClientEvent::RemoveBlock {
                    block_id: remove.block_id,
                })
                .await;
            }

            Message::StopExecutor(stop) => {
                info!(reason = ?stop.reason, "Coordinator requested executor stop");
                self.emit(ClientEvent::StopExecutor { reason: stop.reason }).await;
            }

            Message::Error(err) => {
                error!(code = %err.code, message = %err.message, fatal = err.fatal, "Received error");
                self.emit(ClientEvent::Error {
                    message: err.message,
                    fatal: err.fatal,
                })
                .await;
            }

            other => {
                debug!(message_type = %other.type_name(), "Unhandled message type");
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.state.write().connection_state = state;
    }
}

/// Send a protocol message
async fn send_envelope<S>(write: &mut S, envelope: &MessageEnvelope) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let json = envelope.to_json()?;
    write
        .send(WsMessage::Text(json))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

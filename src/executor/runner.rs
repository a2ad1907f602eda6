//! Execution of a single task attempt
//!
//! A runner moves through `Created -> Deserializing -> Running` and ends in
//! exactly one of `Finished`, `Failed` or `Killed`. The terminal state is
//! reported to the coordinator once. The runner's
//! [`Registration`] is released as soon as the terminal state is reached,
//! before the report goes out, so the coordinator can relaunch the task id
//! the moment it learns the outcome.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::protocol::{TaskMetrics, TaskMetricsSnapshot, TaskState};

use super::backend::ExecutorBackend;
use super::dependency::DependencyCache;
use super::failure::{classify, Classified, FatalErrorHandler, TaskFailureReason};
use super::registry::Registration;
use super::result::{DirectTaskResult, ResultPackager};
use super::task::{KillSwitch, TaskAttempt, TaskBody, TaskCatalog, TaskContext, TaskDescription};

// ─────────────────────────────────────────────────────────────────
// Runner State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of a task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Deserializing,
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Finished | RunnerState::Failed | RunnerState::Killed
        )
    }
}

/// Collaborators shared by every runner of one executor
pub(crate) struct ExecutorEnv {
    pub backend: Arc<dyn ExecutorBackend>,
    pub catalog: Arc<TaskCatalog>,
    pub dependencies: Arc<DependencyCache>,
    pub packager: ResultPackager,
    pub fatal_handler: Arc<dyn FatalErrorHandler>,
    pub strict_leak_detection: bool,
}

/// How an attempt ended, before it is reported
enum Outcome {
    Finished {
        bytes: Vec<u8>,
    },
    Failed {
        reason: TaskFailureReason,
        fatal: Option<anyhow::Error>,
    },
    Killed {
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────
// Task Runner
// ─────────────────────────────────────────────────────────────────

/// Owns the execution of one task attempt
pub struct TaskRunner {
    attempt: TaskAttempt,
    payload: Mutex<Option<Vec<u8>>>,
    kill: Arc<KillSwitch>,
    state: Mutex<RunnerState>,
    metrics: Mutex<TaskMetrics>,
    accumulators: Arc<Mutex<BTreeMap<String, i64>>>,
    run_started: Mutex<Option<Instant>>,
    env: Arc<ExecutorEnv>,
}

impl TaskRunner {
    pub(crate) fn new(attempt: TaskAttempt, payload: Vec<u8>, env: Arc<ExecutorEnv>) -> Self {
        Self {
            attempt,
            payload: Mutex::new(Some(payload)),
            kill: Arc::new(KillSwitch::new()),
            state: Mutex::new(RunnerState::Created),
            metrics: Mutex::new(TaskMetrics::default()),
            accumulators: Arc::new(Mutex::new(BTreeMap::new())),
            run_started: Mutex::new(None),
            env,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.attempt.task_id
    }

    pub fn attempt(&self) -> &TaskAttempt {
        &self.attempt
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill.reason()
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.metrics.lock().clone()
    }

    fn accumulators(&self) -> BTreeMap<String, i64> {
        self.accumulators.lock().clone()
    }

    /// Request a cooperative kill. Only the first reason is kept.
    pub fn kill(&self, interrupt: bool, reason: &str) {
        if self.kill.kill(reason, interrupt) {
            info!(
                task_id = self.task_id(),
                name = %self.attempt.name,
                interrupt,
                reason,
                "Executor is trying to kill task"
            );
        } else {
            debug!(task_id = self.task_id(), "Task already has a kill request");
        }
    }

    /// Metrics copy for heartbeats, only while the body is executing
    pub(crate) fn running_snapshot(&self) -> Option<TaskMetricsSnapshot> {
        if self.state() != RunnerState::Running {
            return None;
        }

        let mut metrics = self.metrics();
        if let Some(started) = *self.run_started.lock() {
            metrics.run_time_ms = started.elapsed().as_millis() as u64;
        }

        Some(TaskMetricsSnapshot {
            task_id: self.attempt.task_id,
            attempt_number: self.attempt.attempt_number,
            metrics,
            accumulators: self.accumulators(),
        })
    }

    /// Move to `next` unless a terminal state was already reached
    fn transition(&self, next: RunnerState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Run the attempt to completion and report its terminal status.
    ///
    /// `registration` is dropped between the terminal transition and the
    /// terminal status update.
    pub(crate) async fn run(self: Arc<Self>, registration: Option<Registration>) {
        info!(
            task_id = self.task_id(),
            attempt = self.attempt.attempt_number,
            name = %self.attempt.name,
            "Running task"
        );
        self.send_status(TaskState::Running, Vec::new()).await;

        let outcome = self.execute().await;
        self.report(outcome, registration).await;
    }

    async fn execute(self: &Arc<Self>) -> Outcome {
        self.transition(RunnerState::Deserializing);
        let started = Instant::now();

        let payload = self.payload.lock().take().unwrap_or_default();
        let description = match TaskDescription::decode(&payload) {
            Ok(description) => description,
            Err(e) => return self.failure(e.into()),
        };

        let report = match self.env.dependencies.reconcile(&description.artifacts).await {
            Ok(report) => report,
            Err(e) => return self.failure(e.into()),
        };
        if !report.fetched.is_empty() {
            debug!(task_id = self.task_id(), fetched = ?report.fetched, "Dependencies updated");
        }

        let body = match self.env.catalog.get(&description.kind) {
            Ok(body) => body,
            Err(e) => return self.failure(e.into()),
        };

        self.metrics.lock().deserialize_time_ms = started.elapsed().as_millis() as u64;

        // Killed while deserializing: the body never runs
        if let Some(reason) = self.kill.reason() {
            return Outcome::Killed { reason };
        }

        self.transition(RunnerState::Running);
        *self.run_started.lock() = Some(Instant::now());

        let ctx = TaskContext::new(
            self.attempt.clone(),
            description.properties,
            self.kill.clone(),
            self.accumulators.clone(),
            self.env.dependencies.search_path(),
            self.env.dependencies.work_dir().to_path_buf(),
        );
        let input = description.input;
        let runner = Arc::clone(self);

        match tokio::task::spawn_blocking(move || runner.run_body(ctx, body, input)).await {
            Ok(outcome) => outcome,
            Err(e) => self.failure(anyhow!("Task thread failed: {}", e)),
        }
    }

    /// Run the body on the current (blocking) thread and settle its outcome
    fn run_body(&self, ctx: TaskContext, body: Arc<dyn TaskBody>, input: Vec<u8>) -> Outcome {
        let task_id = self.task_id();
        let started = Instant::now();

        let result = panic::catch_unwind(AssertUnwindSafe(|| body.run(&ctx, &input)))
            .unwrap_or_else(|payload| Err(anyhow!("Task panicked: {}", panic_message(&*payload))));

        let peak = ctx.memory().peak_bytes();
        let leaked = ctx.memory().teardown();
        {
            let mut metrics = self.metrics.lock();
            metrics.run_time_ms = started.elapsed().as_millis() as u64;
            metrics.peak_tracked_memory_bytes = peak;
            metrics.leaked_memory_bytes = leaked;
        }

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                if leaked > 0 {
                    warn!(task_id, leaked_bytes = leaked, "Managed memory leak in failed task");
                }
                return self.failure(err);
            }
        };

        if leaked > 0 {
            let leak = Error::MemoryLeak {
                task_id,
                bytes: leaked,
            };
            if self.env.strict_leak_detection {
                return self.failure(leak.into());
            }
            warn!(task_id, leaked_bytes = leaked, "{}", leak);
        }

        // Killed while running: the finished value is discarded
        if let Some(reason) = self.kill.reason() {
            return Outcome::Killed { reason };
        }

        self.package(value)
    }

    fn package(&self, value: Vec<u8>) -> Outcome {
        let result = DirectTaskResult {
            value,
            accumulators: self.accumulators(),
            metrics: self.metrics(),
        };

        match self.env.packager.package(self.task_id(), result) {
            Ok(packaged) => {
                let mut metrics = self.metrics.lock();
                metrics.result_size = packaged.size;
                metrics.result_serialization_time_ms = packaged.serialization_time_ms;
                Outcome::Finished {
                    bytes: packaged.bytes,
                }
            }
            Err(e) => self.failure(e.into()),
        }
    }

    fn failure(&self, err: anyhow::Error) -> Outcome {
        let kill_reason = self.kill.reason();
        match classify(
            &err,
            kill_reason.as_deref(),
            self.metrics(),
            self.accumulators(),
        ) {
            Classified::Killed { reason } => Outcome::Killed { reason },
            Classified::Failed { reason, fatal } => {
                error!(
                    task_id = self.task_id(),
                    name = %self.attempt.name,
                    error = ?err,
                    "Exception in task"
                );
                Outcome::Failed {
                    reason,
                    fatal: fatal.then_some(err),
                }
            }
        }
    }

    async fn report(&self, outcome: Outcome, registration: Option<Registration>) {
        let task_id = self.task_id();
        let terminal = match &outcome {
            Outcome::Finished { .. } => RunnerState::Finished,
            Outcome::Killed { .. } => RunnerState::Killed,
            Outcome::Failed { .. } => RunnerState::Failed,
        };
        if !self.transition(terminal) {
            return;
        }
        drop(registration);

        match outcome {
            Outcome::Finished { bytes } => {
                info!(task_id, size = bytes.len(), "Finished task");
                self.send_status(TaskState::Finished, bytes).await;
            }
            Outcome::Killed { reason } => {
                info!(task_id, reason = %reason, "Task killed");
                let payload = TaskFailureReason::TaskKilled {
                    reason,
                    accumulators: self.accumulators(),
                    metrics: self.metrics(),
                };
                self.send_status(TaskState::Killed, encode_reason(task_id, &payload))
                    .await;
            }
            Outcome::Failed { reason, fatal } => {
                self.send_status(TaskState::Failed, encode_reason(task_id, &reason))
                    .await;
                if let Some(err) = fatal {
                    self.env.fatal_handler.handle(task_id, &err);
                }
            }
        }
    }

    async fn send_status(&self, state: TaskState, data: Vec<u8>) {
        if let Err(e) = self
            .env
            .backend
            .status_update(self.task_id(), state, data)
            .await
        {
            error!(task_id = self.task_id(), state = %state, error = %e, "Failed to send status update");
        }
    }
}

pub(crate) fn encode_reason(task_id: i64, reason: &TaskFailureReason) -> Vec<u8> {
    serde_json::to_vec(reason).unwrap_or_else(|e| {
        error!(task_id, error = %e, "Failed to encode failure reason");
        Vec::new()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::registry::TaskRegistry;
    use crate::executor::testing::{executor_env, runner, RecordingBackend};

    #[test]
    fn test_terminal_states() {
        assert!(!RunnerState::Created.is_terminal());
        assert!(!RunnerState::Deserializing.is_terminal());
        assert!(!RunnerState::Running.is_terminal());
        assert!(RunnerState::Finished.is_terminal());
        assert!(RunnerState::Failed.is_terminal());
        assert!(RunnerState::Killed.is_terminal());
    }

    #[tokio::test]
    async fn test_run_reports_running_then_finished() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let runner = runner(1, executor_env(backend.clone(), work_dir.path()));

        runner.clone().run(None).await;

        assert_eq!(backend.states_for(1), vec![TaskState::Running, TaskState::Finished]);
        assert_eq!(runner.state(), RunnerState::Finished);
        assert!(runner.running_snapshot().is_none());
    }

    #[tokio::test]
    async fn test_kill_before_run_skips_body() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let runner = runner(2, executor_env(backend.clone(), work_dir.path()));

        runner.kill(false, "stage cancelled");
        runner.kill(true, "second reason");
        runner.clone().run(None).await;

        assert_eq!(backend.states_for(2), vec![TaskState::Running, TaskState::Killed]);
        assert_eq!(runner.state(), RunnerState::Killed);
        assert_eq!(runner.kill_reason().as_deref(), Some("stage cancelled"));
        assert_eq!(runner.metrics().run_time_ms, 0);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let runner = runner(3, executor_env(backend.clone(), work_dir.path()));

        runner.clone().run(None).await;
        runner.kill(true, "too late");

        assert_eq!(runner.state(), RunnerState::Finished);
        assert!(!runner.transition(RunnerState::Running));
        assert_eq!(backend.terminal_for(3).len(), 1);
    }

    /// Records whether the task was still registered when its statuses arrived
    struct RegistryObservingBackend {
        registry: Arc<TaskRegistry>,
        registered_at: Mutex<Vec<(TaskState, bool)>>,
    }

    #[async_trait::async_trait]
    impl ExecutorBackend for RegistryObservingBackend {
        async fn status_update(&self, task_id: i64, state: TaskState, _data: Vec<u8>) -> crate::error::Result<()> {
            let registered = self.registry.contains(task_id);
            self.registered_at.lock().push((state, registered));
            Ok(())
        }

        async fn heartbeat(
            &self,
            _request: crate::protocol::HeartbeatRequest,
        ) -> crate::error::Result<crate::protocol::HeartbeatResponse> {
            Ok(crate::protocol::HeartbeatResponse::default())
        }

        async fn register_block_store(&self, _id: &crate::protocol::BlockStoreId) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registration_released_before_terminal_status() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let backend = Arc::new(RegistryObservingBackend {
            registry: registry.clone(),
            registered_at: Mutex::new(Vec::new()),
        });
        let env = executor_env(Arc::new(RecordingBackend::default()), work_dir.path());
        let env = Arc::new(ExecutorEnv {
            backend: backend.clone(),
            catalog: env.catalog.clone(),
            dependencies: env.dependencies.clone(),
            packager: env.packager.clone(),
            fatal_handler: env.fatal_handler.clone(),
            strict_leak_detection: false,
        });
        let runner = runner(4, env);
        let registration = Registration::register(registry.clone(), runner.clone()).unwrap();

        runner.clone().run(Some(registration)).await;

        assert_eq!(
            *backend.registered_at.lock(),
            vec![(TaskState::Running, true), (TaskState::Finished, false)]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}

//! Top-level task executor
//!
//! Owns the runner registry, the dependency cache and the heartbeat
//! service, and exposes launch, kill and stop to the coordinator client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ExecutorSettings;
use crate::error::{Error, Result};
use crate::protocol::{BlockStoreId, HeartbeatResponse, TaskMetrics, TaskState};

use super::backend::ExecutorBackend;
use super::block::{task_result_block_id, BlockStore};
use super::dependency::{ArtifactFetcher, DependencyCache, ExtraClasspathProvider, UrlFetcher};
use super::failure::{ExceptionFailure, ExitOnFatal, FatalErrorHandler, TaskFailureReason};
use super::heartbeat::HeartbeatService;
use super::registry::{Registration, TaskRegistry};
use super::result::ResultPackager;
use super::runner::{encode_reason, ExecutorEnv, TaskRunner};
use super::task::{TaskAttempt, TaskCatalog};

/// Timeout for artifact downloads made by the default fetcher
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

// ─────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────

/// Assembles a [`TaskExecutor`] from its collaborators
pub struct TaskExecutorBuilder {
    executor_id: String,
    settings: ExecutorSettings,
    backend: Arc<dyn ExecutorBackend>,
    block_store: Arc<dyn BlockStore>,
    catalog: TaskCatalog,
    work_dir: PathBuf,
    cache_dir: Option<PathBuf>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    fatal_handler: Arc<dyn FatalErrorHandler>,
    extra_classpath: Option<Arc<dyn ExtraClasspathProvider>>,
}

impl TaskExecutorBuilder {
    pub fn catalog(mut self, catalog: TaskCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Directory fetched artifacts are placed in
    pub fn work_dir(mut self, work_dir: PathBuf) -> Self {
        self.work_dir = work_dir;
        self
    }

    /// Shared download cache of the default fetcher
    pub fn cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn fatal_handler(mut self, handler: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal_handler = handler;
        self
    }

    pub fn extra_classpath(mut self, provider: Arc<dyn ExtraClasspathProvider>) -> Self {
        self.extra_classpath = Some(provider);
        self
    }

    /// Build the executor. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<TaskExecutor> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("Executor requires a tokio runtime: {}", e)))?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let cache_dir = self
                    .cache_dir
                    .unwrap_or_else(|| self.work_dir.join("cache"));
                Arc::new(UrlFetcher::new(cache_dir, DEFAULT_FETCH_TIMEOUT)?)
            }
        };

        let mut dependencies = DependencyCache::new(fetcher, self.work_dir.clone())
            .use_fetch_cache(self.settings.fetch_use_cache)
            .user_classpath_first(self.settings.user_classpath_first)
            .with_user_class_path(
                self.settings
                    .user_class_path
                    .iter()
                    .map(PathBuf::from)
                    .collect(),
            );
        if let Some(provider) = self.extra_classpath {
            dependencies = dependencies.with_extra_classpath(provider);
        }

        let registry = Arc::new(TaskRegistry::new());
        let env = Arc::new(ExecutorEnv {
            backend: self.backend.clone(),
            catalog: Arc::new(self.catalog),
            dependencies: Arc::new(dependencies),
            packager: ResultPackager::new(
                self.settings.max_result_size,
                self.settings.max_direct_result_size(),
                self.block_store.clone(),
            ),
            fatal_handler: self.fatal_handler,
            strict_leak_detection: self.settings.strict_leak_detection,
        });

        let heartbeat = HeartbeatService::new(
            self.executor_id.clone(),
            self.settings.heartbeat_interval(),
            self.block_store.id().clone(),
            registry.clone(),
            self.backend,
        );

        let admission = (self.settings.max_concurrent_tasks > 0)
            .then(|| Arc::new(Semaphore::new(self.settings.max_concurrent_tasks)));

        Ok(TaskExecutor {
            executor_id: self.executor_id,
            block_store: self.block_store,
            env,
            registry,
            heartbeat,
            admission,
            runtime,
            in_flight: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            shutdown_timeout: self.settings.shutdown_timeout(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Executor
// ─────────────────────────────────────────────────────────────────

/// Runs launched tasks and reports their status to the coordinator
pub struct TaskExecutor {
    executor_id: String,
    block_store: Arc<dyn BlockStore>,
    env: Arc<ExecutorEnv>,
    registry: Arc<TaskRegistry>,
    heartbeat: HeartbeatService,
    admission: Option<Arc<Semaphore>>,
    runtime: Handle,
    /// Runner futures not yet finished, including their terminal report
    in_flight: Arc<AtomicUsize>,
    stopped: AtomicBool,
    shutdown_timeout: Duration,
}

/// Counts a runner future from spawn until it completes or is dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskExecutor {
    pub fn builder(
        executor_id: impl Into<String>,
        settings: ExecutorSettings,
        backend: Arc<dyn ExecutorBackend>,
        block_store: Arc<dyn BlockStore>,
    ) -> TaskExecutorBuilder {
        TaskExecutorBuilder {
            executor_id: executor_id.into(),
            settings,
            backend,
            block_store,
            catalog: TaskCatalog::new(),
            work_dir: std::env::temp_dir().join("taskhost").join("work"),
            cache_dir: None,
            fetcher: None,
            fatal_handler: Arc::new(ExitOnFatal),
            extra_classpath: None,
        }
    }

    /// Start the heartbeat service
    pub fn start(&self) {
        info!(executor_id = %self.executor_id, "Starting task executor");
        self.heartbeat.start();
    }

    /// Launch one task attempt.
    ///
    /// Fails if the executor was stopped or a runner with the same task id
    /// is still live. The attempt runs in the background; its terminal state
    /// is reported through the backend.
    pub fn launch(
        &self,
        task_id: i64,
        attempt_number: i32,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ExecutorStopped);
        }

        let attempt = TaskAttempt {
            task_id,
            attempt_number,
            name: name.into(),
        };
        let runner = Arc::new(TaskRunner::new(attempt, payload, self.env.clone()));
        let registration = Registration::register(self.registry.clone(), runner.clone())?;

        // a relaunch supersedes the result an earlier attempt left behind
        let stale = task_result_block_id(task_id);
        match self.block_store.remove(&stale) {
            Ok(true) => debug!(task_id, block_id = %stale, "Removed result of earlier attempt"),
            Ok(false) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to remove result of earlier attempt"),
        }

        debug!(task_id, attempt = attempt_number, "Task launched");

        let admission = self.admission.clone();
        let in_flight = InFlight::enter(self.in_flight.clone());
        self.runtime.spawn(async move {
            let _in_flight = in_flight;
            let _permit = match admission {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            runner.run(Some(registration)).await;
        });

        Ok(())
    }

    /// Answer a launch that was rejected with a FAILED status, so the
    /// coordinator does not wait on an attempt that never ran
    pub async fn report_rejected_launch(&self, task_id: i64, err: &Error) {
        let reason = TaskFailureReason::ExceptionFailure(ExceptionFailure::from_error(
            &anyhow::anyhow!("Launch rejected: {}", err),
            TaskMetrics::default(),
            Default::default(),
        ));
        if let Err(e) = self
            .env
            .backend
            .status_update(task_id, TaskState::Failed, encode_reason(task_id, &reason))
            .await
        {
            warn!(task_id, error = %e, "Failed to report rejected launch");
        }
    }

    /// Drop a block the coordinator no longer needs
    pub fn remove_block(&self, block_id: &str) -> Result<bool> {
        let removed = self.block_store.remove(block_id)?;
        debug!(block_id, removed, "Block removal requested");
        Ok(removed)
    }

    /// Deliver a kill request. Unknown task ids are ignored; returns whether
    /// a live runner was found.
    pub fn kill(&self, task_id: i64, interrupt: bool, reason: &str) -> bool {
        match self.registry.get(task_id) {
            Some(runner) => {
                runner.kill(interrupt, reason);
                true
            }
            None => {
                debug!(task_id, "Kill requested for unknown task");
                false
            }
        }
    }

    /// Kill every live task
    pub fn kill_all(&self, interrupt: bool, reason: &str) {
        for task_id in self.registry.task_ids() {
            self.kill(task_id, interrupt, reason);
        }
    }

    /// Stop accepting tasks and shut the heartbeat service down.
    ///
    /// Running tasks are left to finish; use [`TaskExecutor::await_idle`]
    /// to wait for them.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            executor_id = %self.executor_id,
            running_tasks = self.registry.len(),
            "Stopping task executor"
        );
        if !self.heartbeat.stop(self.shutdown_timeout).await {
            warn!("Heartbeat service was aborted during shutdown");
        }
    }

    /// Wait until no task is live and every terminal status was sent.
    /// Returns false on timeout.
    pub async fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 || !self.registry.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Send one heartbeat outside the regular schedule
    pub async fn heartbeat_now(&self) -> Result<HeartbeatResponse> {
        self.heartbeat.beat().await
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn block_store_id(&self) -> &BlockStoreId {
        self.block_store.id()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn running_task_ids(&self) -> Vec<i64> {
        self.registry.task_ids()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

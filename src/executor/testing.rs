//! In-process fakes for executor tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ExecutorSettings;
use crate::error::{Error, Result};
use crate::protocol::{BlockStoreId, HeartbeatRequest, HeartbeatResponse, TaskState};

use super::backend::ExecutorBackend;
use super::block::LocalBlockStore;
use super::builtin::builtin_catalog;
use super::dependency::{DependencyCache, UrlFetcher};
use super::failure::FatalErrorHandler;
use super::result::ResultPackager;
use super::runner::{ExecutorEnv, TaskRunner};
use super::service::TaskExecutor;
use super::task::{TaskAttempt, TaskCatalog, TaskDescription};

/// Backend that records everything the executor sends
#[derive(Default)]
pub(crate) struct RecordingBackend {
    pub statuses: Mutex<Vec<(i64, TaskState, Vec<u8>)>>,
    pub heartbeats: Mutex<Vec<HeartbeatRequest>>,
    pub registrations: Mutex<Vec<BlockStoreId>>,
    pub fail_heartbeats: AtomicBool,
    pub reregister: AtomicBool,
}

impl RecordingBackend {
    pub fn states_for(&self, task_id: i64) -> Vec<TaskState> {
        self.statuses
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == task_id)
            .map(|(_, state, _)| *state)
            .collect()
    }

    pub fn terminal_for(&self, task_id: i64) -> Vec<(TaskState, Vec<u8>)> {
        self.statuses
            .lock()
            .iter()
            .filter(|(id, state, _)| *id == task_id && state.is_terminal())
            .map(|(_, state, data)| (*state, data.clone()))
            .collect()
    }

    /// Poll until the task reported a terminal status
    pub async fn wait_for_terminal(&self, task_id: i64, timeout: Duration) -> (TaskState, Vec<u8>) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(terminal) = self.terminal_for(task_id).into_iter().next() {
                return terminal;
            }
            assert!(
                Instant::now() < deadline,
                "task {} reported no terminal status within {:?}",
                task_id,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the task reported RUNNING
    pub async fn wait_for_running(&self, task_id: i64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.states_for(task_id).contains(&TaskState::Running) {
            assert!(Instant::now() < deadline, "task {} never started", task_id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ExecutorBackend for RecordingBackend {
    async fn status_update(&self, task_id: i64, state: TaskState, data: Vec<u8>) -> Result<()> {
        self.statuses.lock().push((task_id, state, data));
        Ok(())
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.heartbeats.lock().push(request);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(Error::Connection("coordinator unreachable".to_string()));
        }
        Ok(HeartbeatResponse {
            reregister_block_manager: self.reregister.load(Ordering::SeqCst),
        })
    }

    async fn register_block_store(&self, block_store_id: &BlockStoreId) -> Result<()> {
        self.registrations.lock().push(block_store_id.clone());
        Ok(())
    }
}

/// Fatal handler that records instead of exiting
#[derive(Default)]
pub(crate) struct RecordingFatalHandler {
    pub calls: Mutex<Vec<(i64, String)>>,
}

impl FatalErrorHandler for RecordingFatalHandler {
    fn handle(&self, task_id: i64, err: &anyhow::Error) {
        self.calls.lock().push((task_id, err.to_string()));
    }
}

pub(crate) fn block_store_id() -> BlockStoreId {
    BlockStoreId {
        executor_id: "exec-test".to_string(),
        host: "localhost".to_string(),
    }
}

pub(crate) fn payload(kind: &str, input: &[u8]) -> Vec<u8> {
    TaskDescription::new(kind, input.to_vec())
        .encode()
        .unwrap()
}

/// Executor wired to recording fakes and a temporary work directory
pub(crate) struct TestExecutor {
    pub executor: TaskExecutor,
    pub backend: Arc<RecordingBackend>,
    pub fatal: Arc<RecordingFatalHandler>,
    pub block_store: Arc<LocalBlockStore>,
    _work_dir: tempfile::TempDir,
}

pub(crate) fn test_executor(settings: ExecutorSettings, catalog: TaskCatalog) -> TestExecutor {
    let work_dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let fatal = Arc::new(RecordingFatalHandler::default());
    let block_store = Arc::new(LocalBlockStore::in_memory(block_store_id()));

    let executor = TaskExecutor::builder("exec-test", settings, backend.clone(), block_store.clone())
        .catalog(catalog)
        .work_dir(work_dir.path().to_path_buf())
        .fatal_handler(fatal.clone())
        .build()
        .unwrap();

    TestExecutor {
        executor,
        backend,
        fatal,
        block_store,
        _work_dir: work_dir,
    }
}

/// Runner environment for tests that drive runners without an executor
pub(crate) fn executor_env(backend: Arc<RecordingBackend>, work_dir: &std::path::Path) -> Arc<ExecutorEnv> {
    let fetcher = Arc::new(UrlFetcher::new(work_dir.join("cache"), Duration::from_secs(5)).unwrap());
    Arc::new(ExecutorEnv {
        backend,
        catalog: Arc::new(builtin_catalog()),
        dependencies: Arc::new(DependencyCache::new(fetcher, work_dir.to_path_buf())),
        packager: ResultPackager::new(0, 1024, Arc::new(LocalBlockStore::in_memory(block_store_id()))),
        fatal_handler: Arc::new(RecordingFatalHandler::default()),
        strict_leak_detection: false,
    })
}

pub(crate) fn runner(task_id: i64, env: Arc<ExecutorEnv>) -> Arc<TaskRunner> {
    let attempt = TaskAttempt {
        task_id,
        attempt_number: 0,
        name: format!("task {}.0", task_id),
    };
    Arc::new(TaskRunner::new(attempt, payload("echo", b""), env))
}

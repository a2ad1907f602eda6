//! Task model
//!
//! A launched task is an immutable [`TaskAttempt`] identity plus the
//! serialized [`TaskDescription`] it carries. Task code is looked up by
//! kind in the [`TaskCatalog`] and runs against a [`TaskContext`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::base64_bytes;

use super::failure::{TaskInterrupted, TaskKilled};
use super::memory::MemoryTracker;

// ─────────────────────────────────────────────────────────────────
// Task Identity and Description
// ─────────────────────────────────────────────────────────────────

/// Identity of one attempt of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAttempt {
    pub task_id: i64,
    pub attempt_number: i32,
    pub name: String,
}

/// Artifacts a task needs, keyed by source name with their timestamps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    /// Plain files, placed in the work directory
    #[serde(default)]
    pub files: BTreeMap<String, i64>,

    /// Code artifacts, also added to the search path
    #[serde(default)]
    pub jars: BTreeMap<String, i64>,
}

impl ArtifactSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.jars.is_empty()
    }
}

/// Decoded LAUNCH_TASK payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    /// Catalog key of the task body
    pub kind: String,

    #[serde(flatten)]
    pub artifacts: ArtifactSet,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default, with = "base64_bytes")]
    pub input: Vec<u8>,
}

impl TaskDescription {
    pub fn new(kind: impl Into<String>, input: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            artifacts: ArtifactSet::default(),
            properties: BTreeMap::new(),
            input,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(format!("Invalid task description: {}", e)))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────
// Kill Switch
// ─────────────────────────────────────────────────────────────────

/// Cooperative kill flag shared between the executor and a running task
#[derive(Debug, Default)]
pub struct KillSwitch {
    reason: Mutex<Option<String>>,
    interrupted: Mutex<bool>,
    wake: Condvar,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the kill flag. The first reason wins; returns whether this call set it.
    /// With `interrupt`, tasks parked in [`KillSwitch::sleep`] are woken.
    pub fn kill(&self, reason: &str, interrupt: bool) -> bool {
        let first = {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        };

        if interrupt {
            *self.interrupted.lock() = true;
            self.wake.notify_all();
        }

        first
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.lock()
    }

    /// Wait up to `duration`, returning early with [`TaskInterrupted`] on interruption
    pub fn sleep(&self, duration: Duration) -> std::result::Result<(), TaskInterrupted> {
        let deadline = Instant::now() + duration;
        let mut interrupted = self.interrupted.lock();
        while !*interrupted {
            if self.wake.wait_until(&mut interrupted, deadline).timed_out() {
                return if *interrupted {
                    Err(TaskInterrupted)
                } else {
                    Ok(())
                };
            }
        }
        Err(TaskInterrupted)
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Context
// ─────────────────────────────────────────────────────────────────

/// Everything a task body can see of its attempt
pub struct TaskContext {
    attempt: TaskAttempt,
    properties: BTreeMap<String, String>,
    kill: Arc<KillSwitch>,
    memory: MemoryTracker,
    accumulators: Arc<Mutex<BTreeMap<String, i64>>>,
    search_path: Vec<PathBuf>,
    work_dir: PathBuf,
}

impl TaskContext {
    pub(crate) fn new(
        attempt: TaskAttempt,
        properties: BTreeMap<String, String>,
        kill: Arc<KillSwitch>,
        accumulators: Arc<Mutex<BTreeMap<String, i64>>>,
        search_path: Vec<PathBuf>,
        work_dir: PathBuf,
    ) -> Self {
        let memory = MemoryTracker::new(attempt.task_id);
        Self {
            attempt,
            properties,
            kill,
            memory,
            accumulators,
            search_path,
            work_dir,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.attempt.task_id
    }

    pub fn attempt_number(&self) -> i32 {
        self.attempt.attempt_number
    }

    pub fn name(&self) -> &str {
        &self.attempt.name
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    /// Fail with [`TaskKilled`] if a kill was requested
    pub fn check_killed(&self) -> std::result::Result<(), TaskKilled> {
        match self.kill.reason() {
            Some(reason) => Err(TaskKilled { reason }),
            None => Ok(()),
        }
    }

    /// Sleep that a kill with interruption cuts short
    pub fn sleep(&self, duration: Duration) -> std::result::Result<(), TaskInterrupted> {
        self.kill.sleep(duration)
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    /// Add `delta` to the named counter reported with heartbeats and results
    pub fn add_counter(&self, name: &str, delta: i64) {
        *self.accumulators.lock().entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.accumulators.lock().get(name).copied().unwrap_or(0)
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Locate a fetched artifact by source name in the work directory
    pub fn resolve_artifact(&self, source: &str) -> Option<PathBuf> {
        let file_name = source.rsplit('/').next().filter(|n| !n.is_empty())?;
        let path = self.work_dir.join(file_name);
        path.exists().then_some(path)
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Bodies
// ─────────────────────────────────────────────────────────────────

/// Executable task code
///
/// Bodies run on a blocking thread. Long-running bodies should call
/// [`TaskContext::check_killed`] or use [`TaskContext::sleep`] so kills
/// take effect before the body returns.
pub trait TaskBody: Send + Sync {
    fn run(&self, ctx: &TaskContext, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Registry of task bodies by kind
#[derive(Default, Clone)]
pub struct TaskCatalog {
    bodies: HashMap<String, Arc<dyn TaskBody>>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body, replacing any previous body of the same kind
    pub fn register(&mut self, kind: impl Into<String>, body: Arc<dyn TaskBody>) {
        self.bodies.insert(kind.into(), body);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn TaskBody>> {
        self.bodies
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskKind {
                kind: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.bodies.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

//! Registry of live task runners
//!
//! An entry exists from launch until the runner reaches its terminal state,
//! just before that state is reported. Removal goes through
//! [`Registration`], which the runner releases after its terminal transition
//! and whose drop also runs if the runner future is abandoned early.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::TaskMetricsSnapshot;

use super::runner::TaskRunner;

/// Concurrent map of task id to runner
#[derive(Default)]
pub struct TaskRegistry {
    runners: RwLock<HashMap<i64, Arc<TaskRunner>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a runner, failing if the id is already live
    pub fn insert(&self, runner: Arc<TaskRunner>) -> Result<()> {
        let task_id = runner.task_id();
        match self.runners.write().entry(task_id) {
            Entry::Occupied(_) => Err(Error::DuplicateTask { task_id }),
            Entry::Vacant(slot) => {
                slot.insert(runner);
                Ok(())
            }
        }
    }

    pub fn remove(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.runners.write().remove(&task_id)
    }

    pub fn get(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.runners.read().get(&task_id).cloned()
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.runners.read().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }

    pub fn task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.runners.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Metrics of every runner currently executing its body.
    ///
    /// Snapshots are copies taken outside the registry lock.
    pub fn running_snapshots(&self) -> Vec<TaskMetricsSnapshot> {
        let runners: Vec<Arc<TaskRunner>> = self.runners.read().values().cloned().collect();
        runners
            .iter()
            .filter_map(|runner| runner.running_snapshot())
            .collect()
    }
}

/// Removes a task from the registry when dropped
pub(crate) struct Registration {
    registry: Arc<TaskRegistry>,
    task_id: i64,
}

impl Registration {
    /// Insert `runner` and return the guard owning its removal
    pub(crate) fn register(registry: Arc<TaskRegistry>, runner: Arc<TaskRunner>) -> Result<Self> {
        let task_id = runner.task_id();
        registry.insert(runner)?;
        Ok(Self { registry, task_id })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(self.task_id).is_some() {
            debug!(task_id = self.task_id, "Task removed from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{executor_env, runner, RecordingBackend};

    #[test]
    fn test_insert_rejects_live_duplicate() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let env = executor_env(Arc::new(RecordingBackend::default()), work_dir.path());
        let registry = TaskRegistry::new();

        registry.insert(runner(3, env.clone())).unwrap();
        registry.insert(runner(1, env.clone())).unwrap();
        let err = registry.insert(runner(3, env)).unwrap_err();

        assert!(matches!(err, Error::DuplicateTask { task_id: 3 }));
        assert_eq!(registry.task_ids(), vec![1, 3]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registration_removes_on_drop() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let env = executor_env(Arc::new(RecordingBackend::default()), work_dir.path());
        let registry = Arc::new(TaskRegistry::new());

        let registration = Registration::register(registry.clone(), runner(5, env.clone())).unwrap();
        assert!(registry.contains(5));
        assert!(Registration::register(registry.clone(), runner(5, env.clone())).is_err());

        drop(registration);
        assert!(registry.is_empty());

        // the id can be reused once the previous attempt is gone
        let _again = Registration::register(registry.clone(), runner(5, env)).unwrap();
        assert!(registry.get(5).is_some());
    }

    #[test]
    fn test_snapshots_skip_runners_not_executing() {
        let work_dir = tempfile::TempDir::new().unwrap();
        let env = executor_env(Arc::new(RecordingBackend::default()), work_dir.path());
        let registry = TaskRegistry::new();

        registry.insert(runner(9, env)).unwrap();
        assert!(registry.running_snapshots().is_empty());
    }
}

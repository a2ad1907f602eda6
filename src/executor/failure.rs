//! Task failure taxonomy
//!
//! Task bodies fail through `anyhow::Error`. The concrete error types below
//! carry the conditions the coordinator treats differently; the runner finds
//! them by downcasting anywhere in the error chain and [`classify`] turns
//! the result into the payload of a FAILED or KILLED status update.

use std::collections::{BTreeMap, TryReserveError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::error::ErrorCode;
use crate::protocol::{BlockStoreId, TaskMetrics};

// ─────────────────────────────────────────────────────────────────
// Failure Conditions
// ─────────────────────────────────────────────────────────────────

/// Remote data required by the task could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Fetch failed from {} (shuffle {shuffle_id}, map {map_id}, reduce {reduce_id}): {message}", display_store(.block_store_id))]
pub struct FetchFailed {
    pub block_store_id: Option<BlockStoreId>,
    pub shuffle_id: i32,
    pub map_id: i64,
    pub reduce_id: i32,
    pub message: String,
}

fn display_store(id: &Option<BlockStoreId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "unknown block store".to_string(),
    }
}

/// Raised by a task body that observed its kill flag
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Task killed: {reason}")]
pub struct TaskKilled {
    pub reason: String,
}

/// Raised when an interruptible wait was woken by a kill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Task interrupted")]
pub struct TaskInterrupted;

/// The coordinator refused to let this attempt commit its output
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Commit denied for job {job_id}, partition {partition}, attempt {attempt_number}")]
pub struct CommitDenied {
    pub job_id: i64,
    pub partition: i32,
    pub attempt_number: i32,
}

/// A condition the whole executor cannot recover from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Fatal error: {message}")]
pub struct ProcessFatal {
    pub message: String,
}

/// A task error the coordinator can reconstruct
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{class_name}: {message}")]
pub struct RemoteException {
    pub class_name: String,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────
// Failure Payloads
// ─────────────────────────────────────────────────────────────────

/// Generic failure payload with best-effort metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionFailure {
    pub class_name: String,
    pub description: String,
    pub stack_trace: String,
    /// The cause itself, only when it can travel to the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteException>,
    #[serde(default)]
    pub accumulators: BTreeMap<String, i64>,
    pub metrics: TaskMetrics,
}

impl ExceptionFailure {
    pub fn from_error(
        err: &anyhow::Error,
        metrics: TaskMetrics,
        accumulators: BTreeMap<String, i64>,
    ) -> Self {
        let remote = find_cause::<RemoteException>(err).and_then(transmittable);
        let class_name = match (&remote, find_cause::<ProcessFatal>(err)) {
            (Some(remote), _) => remote.class_name.clone(),
            (None, Some(_)) => "ProcessFatal".to_string(),
            (None, None) => "TaskError".to_string(),
        };

        Self {
            class_name,
            description: err.to_string(),
            stack_trace: format!("{:?}", err),
            exception: remote,
            accumulators,
            metrics,
        }
    }
}

/// Only a cause that survives serialization is sent; otherwise the
/// payload falls back to the textual trace.
fn transmittable(cause: &RemoteException) -> Option<RemoteException> {
    serde_json::to_vec(cause)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

/// Reason carried by FAILED and KILLED status updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskFailureReason {
    /// Recompute the stage that produced the missing data
    FetchFailed(FetchFailed),
    TaskKilled {
        reason: String,
        #[serde(default)]
        accumulators: BTreeMap<String, i64>,
        metrics: TaskMetrics,
    },
    TaskCommitDenied(CommitDenied),
    ExceptionFailure(ExceptionFailure),
}

impl TaskFailureReason {
    /// Whether the coordinator counts this failure toward the task's retry limit
    pub fn counts_toward_failures(&self) -> bool {
        matches!(self, TaskFailureReason::ExceptionFailure(_))
    }

    /// Whether the producing stage must be recomputed instead of retrying this task
    pub fn requires_stage_recompute(&self) -> bool {
        matches!(self, TaskFailureReason::FetchFailed(_))
    }

    pub fn to_error_string(&self) -> String {
        match self {
            TaskFailureReason::FetchFailed(fetch) => fetch.to_string(),
            TaskFailureReason::TaskKilled { reason, .. } => format!("TaskKilled ({})", reason),
            TaskFailureReason::TaskCommitDenied(denied) => denied.to_string(),
            TaskFailureReason::ExceptionFailure(failure) => {
                format!("{}: {}", failure.class_name, failure.description)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────

/// Outcome of classifying a task body error
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Failed {
        reason: TaskFailureReason,
        /// Run the fatal handler after reporting
        fatal: bool,
    },
    Killed {
        reason: String,
    },
}

/// First cause of type `T` anywhere in the chain
pub fn find_cause<T>(err: &anyhow::Error) -> Option<&T>
where
    T: std::error::Error + Send + Sync + 'static,
{
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}

/// Resource exhaustion and explicit [`ProcessFatal`] errors take the process down
pub fn is_process_fatal(err: &anyhow::Error) -> bool {
    find_cause::<ProcessFatal>(err).is_some() || find_cause::<TryReserveError>(err).is_some()
}

/// Classify a task body error. First match wins: upstream fetch failure,
/// kill-induced interruption while the kill flag is set, commit denial,
/// then everything else as a generic failure.
pub fn classify(
    err: &anyhow::Error,
    kill_reason: Option<&str>,
    metrics: TaskMetrics,
    accumulators: BTreeMap<String, i64>,
) -> Classified {
    if let Some(fetch) = find_cause::<FetchFailed>(err) {
        return Classified::Failed {
            reason: TaskFailureReason::FetchFailed(fetch.clone()),
            fatal: false,
        };
    }

    if let Some(reason) = kill_reason {
        let interrupted = find_cause::<TaskKilled>(err).is_some()
            || find_cause::<TaskInterrupted>(err).is_some();
        if interrupted {
            return Classified::Killed {
                reason: reason.to_string(),
            };
        }
    }

    if let Some(denied) = find_cause::<CommitDenied>(err) {
        return Classified::Failed {
            reason: TaskFailureReason::TaskCommitDenied(denied.clone()),
            fatal: false,
        };
    }

    Classified::Failed {
        reason: TaskFailureReason::ExceptionFailure(ExceptionFailure::from_error(
            err,
            metrics,
            accumulators,
        )),
        fatal: is_process_fatal(err),
    }
}

// ─────────────────────────────────────────────────────────────────
// Fatal Handler
// ─────────────────────────────────────────────────────────────────

/// Process-wide reaction to a fatal task error, run after the FAILED status was sent
pub trait FatalErrorHandler: Send + Sync {
    fn handle(&self, task_id: i64, err: &anyhow::Error);
}

/// Logs the error and exits the process
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnFatal;

impl FatalErrorHandler for ExitOnFatal {
    fn handle(&self, task_id: i64, err: &anyhow::Error) {
        error!(task_id, error = ?err, "Fatal error in task, exiting executor");
        std::process::exit(ErrorCode::ExecutionFailed.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn classify_plain(err: &anyhow::Error, kill_reason: Option<&str>) -> Classified {
        classify(err, kill_reason, TaskMetrics::default(), BTreeMap::new())
    }

    fn fetch_failed() -> FetchFailed {
        FetchFailed {
            block_store_id: Some(BlockStoreId {
                executor_id: "exec-2".to_string(),
                host: "node-2".to_string(),
            }),
            shuffle_id: 1,
            map_id: 4,
            reduce_id: 0,
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_fetch_failure_wins_even_when_killed() {
        let err = anyhow::Error::new(fetch_failed()).context("reading shuffle block");
        match classify_plain(&err, Some("stage cancelled")) {
            Classified::Failed { reason, fatal } => {
                assert!(reason.requires_stage_recompute());
                assert!(!reason.counts_toward_failures());
                assert!(!fatal);
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_interruption_while_killed_is_killed() {
        let err = anyhow::Error::new(TaskInterrupted);
        assert_eq!(
            classify_plain(&err, Some("speculative copy finished")),
            Classified::Killed {
                reason: "speculative copy finished".to_string()
            }
        );
    }

    #[test]
    fn test_interruption_without_kill_is_generic_failure() {
        let err = anyhow::Error::new(TaskInterrupted);
        match classify_plain(&err, None) {
            Classified::Failed {
                reason: TaskFailureReason::ExceptionFailure(failure),
                ..
            } => assert_eq!(failure.description, "Task interrupted"),
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_commit_denied() {
        let denied = CommitDenied {
            job_id: 3,
            partition: 9,
            attempt_number: 1,
        };
        let err = anyhow::Error::new(denied.clone());
        assert_eq!(
            classify_plain(&err, None),
            Classified::Failed {
                reason: TaskFailureReason::TaskCommitDenied(denied),
                fatal: false,
            }
        );
    }

    #[test]
    fn test_remote_exception_is_transmitted() {
        let remote = RemoteException {
            class_name: "ArithmeticError".to_string(),
            message: "division by zero".to_string(),
            detail: serde_json::json!({"row": 12}),
        };
        let err = anyhow::Error::new(remote.clone());

        match classify_plain(&err, None) {
            Classified::Failed {
                reason: TaskFailureReason::ExceptionFailure(failure),
                fatal,
            } => {
                assert!(!fatal);
                assert_eq!(failure.class_name, "ArithmeticError");
                assert_eq!(failure.exception, Some(remote));
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_non_transmittable_cause_is_trace_only() {
        let err = anyhow::anyhow!("socket closed").context("writing partition 4");

        match classify_plain(&err, None) {
            Classified::Failed {
                reason: TaskFailureReason::ExceptionFailure(failure),
                fatal,
            } => {
                assert!(!fatal);
                assert!(failure.exception.is_none());
                assert_eq!(failure.description, "writing partition 4");
                assert!(failure.stack_trace.contains("socket closed"));
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_process_fatal_is_flagged() {
        let err = anyhow::Error::new(ProcessFatal {
            message: "out of memory".to_string(),
        });
        match classify_plain(&err, None) {
            Classified::Failed {
                reason: TaskFailureReason::ExceptionFailure(failure),
                fatal,
            } => {
                assert!(fatal);
                assert_eq!(failure.class_name, "ProcessFatal");
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_allocation_failure_is_process_fatal() {
        let mut buffer: Vec<u8> = Vec::new();
        let err = buffer
            .try_reserve(usize::MAX)
            .context("allocating sort buffer")
            .unwrap_err();
        assert!(is_process_fatal(&err));
    }

    #[test]
    fn test_failure_reason_wire_tag() {
        let reason = TaskFailureReason::TaskKilled {
            reason: "stage cancelled".to_string(),
            accumulators: BTreeMap::new(),
            metrics: TaskMetrics::default(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["failure"], "TASK_KILLED");
        assert_eq!(json["reason"], "stage cancelled");
        assert_eq!(reason.to_error_string(), "TaskKilled (stage cancelled)");
    }
}

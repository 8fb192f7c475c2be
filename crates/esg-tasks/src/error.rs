//! Error types for task-lifecycle operations.
//!
//! Provides [`TaskError`], the error enum every component returns, with a
//! mapping onto HTTP-equivalent status codes for the protocol surface.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::broker::BrokerError;
use crate::types::task::{TaskKind, TaskStatus};

/// How the dispatcher cleaned up after a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The registry entry was deleted again.
    RolledBack,
    /// The entry could not be deleted and was marked failed instead.
    MarkedFailed,
    /// Neither cleanup succeeded. The entry may remain pending.
    Unresolved,
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RolledBack => write!(f, "rolled back"),
            Self::MarkedFailed => write!(f, "marked failed"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Errors that can occur during task operations.
///
/// Each variant carries the context needed to act on it. Use
/// [`http_status`](TaskError::http_status) to map onto the protocol surface
/// and [`error_code`](TaskError::error_code) for a stable machine-readable
/// code.
///
/// # Examples
///
/// ```
/// use esg_tasks::TaskError;
///
/// let err = TaskError::NotFound {
///     task_id: "missing-task".to_string(),
/// };
/// assert_eq!(err.http_status(), 404);
/// assert_eq!(err.error_code(), "not_found");
/// assert!(err.to_string().contains("missing-task"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The submitted kind is not one of the known kinds.
    #[error("unknown task kind: {kind}")]
    UnknownKind {
        /// The rejected kind string.
        kind: String,
    },

    /// The kind is known but not served by this deployment.
    #[error("task kind {kind} is not enabled")]
    UnsupportedKind {
        /// The disabled kind.
        kind: TaskKind,
    },

    /// No task with this id exists, or it was garbage-collected.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A result was requested before the task reached a terminal status.
    #[error("task not in terminal state: {task_id} (status: {status})")]
    NotReady {
        /// The task ID.
        task_id: String,
        /// The task's current, non-terminal status.
        status: TaskStatus,
    },

    /// The state machine rejected a transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The current status of the task.
        from: TaskStatus,
        /// The rejected target status.
        to: TaskStatus,
    },

    /// The caller no longer holds the execution claim on the task.
    #[error("worker {worker_id} no longer holds the claim on task {task_id}")]
    ClaimLost {
        /// The task ID.
        task_id: String,
        /// The worker whose claim was superseded.
        worker_id: String,
    },

    /// A compare-and-swap write kept losing against concurrent writers.
    #[error(
        "concurrent modification of task {task_id}: expected version {expected_version}, found {actual_version}"
    )]
    ConcurrentModification {
        /// The task ID.
        task_id: String,
        /// Version the writer read.
        expected_version: u64,
        /// Version found at write time.
        actual_version: u64,
    },

    /// Publishing a new task to the broker failed. The registry entry was
    /// reconciled before this error was returned.
    #[error("failed to dispatch task {task_id} ({reconciliation}): {reason}")]
    DispatchFailure {
        /// The identifier that was assigned and then reconciled.
        task_id: String,
        /// What happened to the registry entry.
        reconciliation: Reconciliation,
        /// Why publishing failed.
        reason: String,
    },

    /// A progress payload exceeds the configured size limit.
    #[error("progress payload of {actual_bytes} bytes exceeds the {limit_bytes} byte limit")]
    ProgressTooLarge {
        /// The configured limit in bytes.
        limit_bytes: usize,
        /// The serialized payload size in bytes.
        actual_bytes: usize,
    },

    /// A call against the registry or broker exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The configured deadline.
        after: Duration,
    },

    /// Broker transport failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Registry storage failure.
    #[error("store error: {0}")]
    Store(String),

    /// A stored record or payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TaskError {
    /// Maps this error to the HTTP-equivalent status of the protocol surface.
    ///
    /// - `400`: `UnknownKind`, `UnsupportedKind`
    /// - `404`: `NotFound`
    /// - `409`: `NotReady`, `InvalidTransition`, `ClaimLost`, `ConcurrentModification`
    /// - `413`: `ProgressTooLarge`
    /// - `503`: `DispatchFailure`, `Broker`
    /// - `504`: `Timeout`
    /// - `500`: `Store`, `Serialization`
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownKind { .. } | Self::UnsupportedKind { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::NotReady { .. }
            | Self::InvalidTransition { .. }
            | Self::ClaimLost { .. }
            | Self::ConcurrentModification { .. } => 409,
            Self::ProgressTooLarge { .. } => 413,
            Self::DispatchFailure { .. } | Self::Broker(_) => 503,
            Self::Timeout { .. } => 504,
            Self::Store(_) | Self::Serialization(_) => 500,
        }
    }

    /// Stable snake_case code for response bodies and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownKind { .. } => "unknown_kind",
            Self::UnsupportedKind { .. } => "unsupported_kind",
            Self::NotFound { .. } => "not_found",
            Self::NotReady { .. } => "not_ready",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ClaimLost { .. } => "claim_lost",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::ProgressTooLarge { .. } => "progress_too_large",
            Self::DispatchFailure { .. } => "dispatch_failure",
            Self::Timeout { .. } => "timeout",
            Self::Broker(_) => "broker_error",
            Self::Store(_) => "store_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// `true` for errors caused by the caller's request rather than the
    /// infrastructure.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Runs a registry or broker call under a deadline.
pub(crate) async fn with_timeout<T, E, F>(
    operation: &str,
    after: Duration,
    call: F,
) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, E>>,
    TaskError: From<E>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(TaskError::from),
        Err(_) => Err(TaskError::timeout(operation, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = TaskError::NotReady {
            task_id: "abc".to_string(),
            status: TaskStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "task not in terminal state: abc (status: running)"
        );

        let err = TaskError::DispatchFailure {
            task_id: "t9".to_string(),
            reconciliation: Reconciliation::RolledBack,
            reason: "queue unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to dispatch task t9 (rolled back): queue unavailable"
        );
    }

    #[test]
    fn http_statuses() {
        assert_eq!(
            TaskError::UnknownKind {
                kind: "x".to_string()
            }
            .http_status(),
            400
        );
        assert_eq!(
            TaskError::NotReady {
                task_id: "t".to_string(),
                status: TaskStatus::Pending,
            }
            .http_status(),
            409
        );
        assert_eq!(
            TaskError::timeout("fetch_result", Duration::from_secs(1)).http_status(),
            504
        );
        assert_eq!(
            TaskError::Broker(BrokerError::Unavailable {
                message: "down".to_string()
            })
            .http_status(),
            503
        );
        assert_eq!(TaskError::Store("disk".to_string()).http_status(), 500);
    }

    #[test]
    fn client_errors() {
        assert!(TaskError::NotFound {
            task_id: "t".to_string()
        }
        .is_client_error());
        assert!(!TaskError::Serialization("bad".to_string()).is_client_error());
    }
}

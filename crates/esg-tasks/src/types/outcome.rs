//! Reader-facing views: status reports, task outcomes, computation errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::TaskRecord;
use crate::types::progress::TaskProgress;
use crate::types::task::{TaskKind, TaskStatus};

/// Error raised by a computation callback.
///
/// Stored as the result payload of a failed task and returned to callers
/// through the same result path as a success. It never surfaces as a system
/// fault of the worker process.
///
/// # Examples
///
/// ```
/// use esg_tasks::ComputationError;
/// use serde_json::json;
///
/// let err = ComputationError::invalid_input("missing field `x`")
///     .with_detail(json!({"field": "x"}));
/// assert_eq!(err.code, "invalid_input");
/// assert_eq!(err.to_string(), "invalid_input: missing field `x`");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ComputationError {
    /// Stable, machine-readable error class.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ComputationError {
    /// Generic computation failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code("computation_failed", message)
    }

    /// Failure with an explicit error class.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    /// The payload could not be interpreted by the computation.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::with_code("invalid_input", message)
    }

    /// The computation panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::with_code("panicked", message)
    }

    /// No computation is registered for the kind.
    pub fn unsupported_kind(kind: TaskKind) -> Self {
        Self::with_code(
            "unsupported_kind",
            format!("no computation registered for kind {kind}"),
        )
    }

    /// Attaches structured context.
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// The final payload of a terminal task.
///
/// Serializes as `{"status": "ready", "payload": ...}` or
/// `{"status": "failed", "payload": {"code": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The computation's success result, unmodified.
    Ready(Value),
    /// The recorded error detail.
    Failed(ComputationError),
}

impl TaskOutcome {
    /// The terminal status this outcome belongs to.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Ready(_) => TaskStatus::Ready,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }

    /// Encodes the outcome as the value written to the result store.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Ready(value) => value.clone(),
            Self::Failed(err) => serde_json::to_value(err).unwrap_or_else(|_| {
                serde_json::json!({ "code": err.code, "message": err.message })
            }),
        }
    }
}

/// Latest known state of a task, as answered to a status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// The task identifier.
    pub task_id: String,
    /// The task's kind.
    pub kind: TaskKind,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Last progress published by the worker, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last registry mutation.
    pub updated_at: DateTime<Utc>,
    /// Reason attached to failures that carry no stored result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl StatusReport {
    /// `true` when the task is running and has not been touched for longer
    /// than `threshold`.
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && now - self.updated_at > threshold
    }
}

impl From<&TaskRecord> for StatusReport {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            kind: record.kind,
            status: record.status,
            progress: record.progress.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            status_message: record.status_message.clone(),
        }
    }
}

//! Task record -- the registry's persisted representation of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::progress::TaskProgress;
use crate::types::task::{TaskKind, TaskStatus};

/// Persisted state of one task, keyed by `task_id`.
///
/// Serialized to canonical JSON at the storage boundary. The `version`
/// field is not serialized: it is filled from the backend's version counter
/// on every read and used for compare-and-swap on write.
///
/// # Examples
///
/// ```
/// use esg_tasks::{TaskKind, TaskRecord, TaskStatus};
///
/// let record = TaskRecord::new(TaskKind::Request);
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert_eq!(record.attempt, 0);
/// assert!(record.result_ref.is_none());
/// assert_eq!(record.created_at, record.updated_at);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Time-ordered UUID (v7), immutable.
    pub task_id: String,

    /// Which computation serves this task.
    pub kind: TaskKind,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Last progress published while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,

    /// Creation time, never changes.
    pub created_at: DateTime<Utc>,

    /// Time of the last successful mutation.
    pub updated_at: DateTime<Utc>,

    /// Key of the final payload in the broker's result store. Written once,
    /// together with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,

    /// Worker currently holding the execution claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// Number of claims so far. Zero while pending.
    #[serde(default)]
    pub attempt: u32,

    /// Reason for failures that have no stored result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Storage version for optimistic concurrency.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Creates a pending record with a fresh `UUIDv7` id.
    pub fn new(kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::now_v7().to_string(),
            kind,
            status: TaskStatus::Pending,
            progress: None,
            created_at: now,
            updated_at: now,
            result_ref: None,
            claimed_by: None,
            attempt: 0,
            status_message: None,
            version: 0,
        }
    }

    /// Returns `true` if the task reached `ready` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns `true` if this record is terminal and was last touched more
    /// than `retention` before `now`.
    ///
    /// Non-terminal records never expire, whatever their age.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Duration;
    /// use esg_tasks::{TaskKind, TaskRecord, TaskStatus};
    ///
    /// let mut record = TaskRecord::new(TaskKind::Request);
    /// let much_later = record.updated_at + Duration::days(30);
    /// assert!(!record.is_retention_expired(much_later, Duration::days(1)));
    ///
    /// record.status = TaskStatus::Ready;
    /// assert!(record.is_retention_expired(much_later, Duration::days(1)));
    /// ```
    pub fn is_retention_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.is_terminal() && now - self.updated_at > retention
    }

    /// Time since the last mutation.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }

    /// Refreshes `updated_at`. Called on every mutation.
    ///
    /// Never moves the timestamp backward, even if the clock does.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Builds the result-store key for one execution attempt of a task.
///
/// ```
/// assert_eq!(esg_tasks::domain::result_key("abc", 2), "abc.2");
/// ```
pub fn result_key(task_id: &str, attempt: u32) -> String {
    format!("{task_id}.{attempt}")
}

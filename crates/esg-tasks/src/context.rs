//! Per-execution handle passed to computations.
//!
//! [`TaskContext`] scopes registry access to the one task and claim being
//! executed, so a computation can publish progress without knowing task
//! ids, worker ids or attempts.
//!
//! `TaskContext` is `Clone + Send + Sync`: it wraps an `Arc<dyn TaskRegistry>`
//! and a few strings, and clones refer to the same execution.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use esg_tasks::context::TaskContext;
//! use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
//! use esg_tasks::store::{ClaimOutcome, TaskRegistry};
//! use esg_tasks::{TaskKind, TaskProgress, TaskRecord};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
//! let record = registry.insert(TaskRecord::new(TaskKind::Request)).await.unwrap();
//! let ClaimOutcome::Claimed(claimed) = registry
//!     .claim(&record.task_id, "worker-1", false)
//!     .await
//!     .unwrap()
//! else {
//!     unreachable!()
//! };
//!
//! let ctx = TaskContext::new(registry.clone(), &claimed, "worker-1");
//! ctx.report_progress(TaskProgress::percent(50.0)).await.unwrap();
//!
//! let latest = ctx.get().await.unwrap();
//! assert_eq!(latest.progress.unwrap().percent_complete, Some(50.0));
//! # });
//! ```

use std::fmt;
use std::sync::Arc;

use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::store::TaskRegistry;
use crate::types::progress::TaskProgress;
use crate::types::task::TaskKind;

/// Handle to the task a computation is executing.
#[derive(Clone)]
pub struct TaskContext {
    registry: Arc<dyn TaskRegistry>,
    task_id: String,
    kind: TaskKind,
    worker_id: String,
    attempt: u32,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("worker_id", &self.worker_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Creates a context for the claim recorded in `record`.
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        record: &TaskRecord,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            task_id: record.task_id.clone(),
            kind: record.kind,
            worker_id: worker_id.into(),
            attempt: record.attempt,
        }
    }

    /// The task being executed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The task's kind.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// The worker holding the claim.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Which execution of the task this is, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Latest registry record of the task.
    pub async fn get(&self) -> Result<TaskRecord, TaskError> {
        self.registry.get(&self.task_id).await
    }

    /// Publishes advisory progress. Last write wins.
    ///
    /// # Errors
    ///
    /// [`TaskError::ClaimLost`] once another worker took the task over;
    /// computations may ignore progress errors and keep going.
    pub async fn report_progress(&self, progress: TaskProgress) -> Result<(), TaskError> {
        self.registry
            .report_progress(&self.task_id, &self.worker_id, progress)
            .await?;
        tracing::debug!(task_id = %self.task_id, attempt = self.attempt, "progress reported");
        Ok(())
    }
}

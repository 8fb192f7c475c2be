//! Task Registry trait, generic implementation, and storage backends.
//!
//! # Architecture
//!
//! The registry has three layers:
//!
//! 1. **[`TaskRegistry`]** -- the type-erased interface components hold as
//!    `Arc<dyn TaskRegistry>`.
//! 2. **[`GenericTaskRegistry<B>`](generic::GenericTaskRegistry)** -- all
//!    domain logic: state machine, claim rules, write-once result reference,
//!    CAS retries, canonical serialization. Has a blanket `TaskRegistry` impl.
//! 3. **[`StorageBackend`]** -- dumb versioned KV storage
//!    ([`InMemoryBackend`](memory::InMemoryBackend),
//!    [`FsBackend`](fs::FsBackend)).
//!
//! # Mutation ownership
//!
//! Each mutation belongs to exactly one component: the dispatcher inserts
//! (and reconciles with `delete`/`fail` on a failed publish), the worker
//! claims, reports progress and completes, the garbage collector deletes
//! (and fails stale tasks when explicitly configured to).

pub mod backend;
pub mod fs;
pub mod generic;
pub mod memory;

use async_trait::async_trait;

pub use backend::{StorageBackend, StorageError, VersionedRecord};

use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::types::progress::TaskProgress;
use crate::types::task::TaskStatus;

/// Registry tuning.
///
/// # Defaults
///
/// | Setting              | Default | Description                                   |
/// |----------------------|---------|-----------------------------------------------|
/// | `max_cas_retries`    | 3       | Re-reads after a version conflict             |
/// | `max_progress_bytes` | 65,536  | Largest serialized progress payload accepted  |
///
/// # Examples
///
/// ```
/// use esg_tasks::store::RegistryConfig;
///
/// let config = RegistryConfig {
///     max_cas_retries: 10,
///     ..RegistryConfig::default()
/// };
/// assert_eq!(config.max_progress_bytes, 65_536);
/// ```
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How many times a mutation is re-read and re-validated after losing a
    /// compare-and-swap before [`TaskError::ConcurrentModification`] is
    /// returned.
    pub max_cas_retries: u32,

    /// Upper bound for the serialized size of a progress update.
    pub max_progress_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 3,
            max_progress_bytes: 65_536,
        }
    }
}

/// Result of a worker's attempt to claim a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the claim. The record shows the new attempt.
    Claimed(TaskRecord),
    /// The task already finished; nothing was changed.
    AlreadyTerminal(TaskRecord),
    /// Another worker holds the claim and the delivery was not a
    /// redelivery; nothing was changed.
    HeldElsewhere(TaskRecord),
}

impl ClaimOutcome {
    /// The record as observed by the claim.
    pub fn record(&self) -> &TaskRecord {
        match self {
            Self::Claimed(r) | Self::AlreadyTerminal(r) | Self::HeldElsewhere(r) => r,
        }
    }
}

/// Task Registry interface.
///
/// Object-safe so that dispatchers, workers, readers and collectors can
/// share one `Arc<dyn TaskRegistry>`. Every mutation is an idempotent
/// upsert keyed by `task_id` plus the expected prior state: transitions the
/// state machine rejects change nothing.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Stores a freshly created record.
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, TaskError>;

    /// Latest record for `task_id`.
    async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError>;

    /// Claims a task for execution by `worker_id`.
    ///
    /// `pending` tasks are claimed. `running` tasks are only taken over when
    /// `redelivered` is set, which bumps `attempt` so the previous executor
    /// can no longer complete. Terminal tasks are returned untouched.
    async fn claim(
        &self,
        task_id: &str,
        worker_id: &str,
        redelivered: bool,
    ) -> Result<ClaimOutcome, TaskError>;

    /// Replaces the progress of a running task held by `worker_id`.
    async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress: TaskProgress,
    ) -> Result<TaskRecord, TaskError>;

    /// Moves a running task to `ready` or `failed` and records where its
    /// result payload lives. Only the current claim (`worker_id` and
    /// `attempt`) may complete.
    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        status: TaskStatus,
        result_ref: String,
    ) -> Result<TaskRecord, TaskError>;

    /// Fails a pending or running task without a result payload.
    async fn fail(&self, task_id: &str, message: String) -> Result<TaskRecord, TaskError>;

    /// Removes a task. Returns `false` if it did not exist.
    async fn delete(&self, task_id: &str) -> Result<bool, TaskError>;

    /// Every task id currently stored.
    async fn list_ids(&self) -> Result<Vec<String>, TaskError>;

    /// The registry configuration.
    fn config(&self) -> &RegistryConfig;
}

#[async_trait]
impl<B: StorageBackend + 'static> TaskRegistry for generic::GenericTaskRegistry<B> {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, TaskError> {
        self.insert(record).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.get(task_id).await
    }

    async fn claim(
        &self,
        task_id: &str,
        worker_id: &str,
        redelivered: bool,
    ) -> Result<ClaimOutcome, TaskError> {
        self.claim(task_id, worker_id, redelivered).await
    }

    async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress: TaskProgress,
    ) -> Result<TaskRecord, TaskError> {
        self.report_progress(task_id, worker_id, progress).await
    }

    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        status: TaskStatus,
        result_ref: String,
    ) -> Result<TaskRecord, TaskError> {
        self.complete(task_id, worker_id, attempt, status, result_ref)
            .await
    }

    async fn fail(&self, task_id: &str, message: String) -> Result<TaskRecord, TaskError> {
        self.fail(task_id, message).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.delete(task_id).await
    }

    async fn list_ids(&self) -> Result<Vec<String>, TaskError> {
        self.list_ids().await
    }

    fn config(&self) -> &RegistryConfig {
        self.config()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
    use crate::types::task::TaskKind;

    #[tokio::test]
    async fn generic_registry_as_dyn_task_registry() {
        let registry: Arc<dyn TaskRegistry> =
            Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));

        let record = registry
            .insert(TaskRecord::new(TaskKind::FitParameters))
            .await
            .unwrap();
        let claimed = registry
            .claim(&record.task_id, "w1", false)
            .await
            .unwrap();
        assert!(matches!(claimed, ClaimOutcome::Claimed(_)));

        let done = registry
            .complete(&record.task_id, "w1", 1, TaskStatus::Ready, "r.1".into())
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Ready);
        assert_eq!(registry.config().max_cas_retries, 3);
    }
}

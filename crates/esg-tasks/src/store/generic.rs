//! Generic Task Registry with all domain logic delegating to a [`StorageBackend`].
//!
//! [`GenericTaskRegistry`] implements every registry operation (state machine
//! validation, claim ownership, write-once result reference, progress size
//! limits, canonical JSON serialization) on top of any backend.
//!
//! # CAS Semantics
//!
//! Every mutation except `insert` is read, validate, `put_if_version`. When
//! the write loses against a concurrent writer, the record is re-read and the
//! mutation re-validated against the new state, up to
//! [`RegistryConfig::max_cas_retries`] times. Re-validation is what makes
//! redelivered or racing mutations collapse into no-ops instead of
//! overwriting a newer state.

use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::store::backend::{StorageBackend, StorageError};
use crate::store::{ClaimOutcome, RegistryConfig};
use crate::types::progress::TaskProgress;
use crate::types::task::TaskStatus;

/// What a mutation closure decided after inspecting the current record.
enum Decision<T> {
    /// Persist the (mutated) record.
    Write(T),
    /// Leave storage untouched.
    Skip(T),
}

#[derive(Debug, Clone, Copy)]
enum ClaimState {
    Claimed,
    AlreadyTerminal,
    HeldElsewhere,
}

/// Task Registry delegating storage to a [`StorageBackend`].
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation (in-memory, filesystem, ...).
#[derive(Debug)]
pub struct GenericTaskRegistry<B: StorageBackend> {
    backend: B,
    config: RegistryConfig,
}

impl<B: StorageBackend> GenericTaskRegistry<B> {
    /// Creates a registry with [`RegistryConfig::default`].
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: RegistryConfig::default(),
        }
    }

    /// Sets the registry configuration.
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ---- Serialization helpers (private) ----

    fn serialize_record(record: &TaskRecord) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(record)
            .map_err(|e| TaskError::Serialization(format!("failed to serialize TaskRecord: {e}")))
    }

    fn deserialize_record(data: &[u8]) -> Result<TaskRecord, TaskError> {
        serde_json::from_slice(data).map_err(|e| {
            TaskError::Serialization(format!("failed to deserialize TaskRecord: {e}"))
        })
    }

    fn map_storage_error(err: StorageError, task_id: &str) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::NotFound {
                task_id: task_id.to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => TaskError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected_version: expected,
                actual_version: actual,
            },
            StorageError::AlreadyExists { key } => {
                TaskError::Store(format!("task id already in use: {key}"))
            }
            other @ StorageError::Backend { .. } => TaskError::Store(other.to_string()),
        }
    }

    async fn load(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let versioned = self
            .backend
            .get(task_id)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;
        let mut record = Self::deserialize_record(&versioned.data)?;
        record.version = versioned.version;
        Ok(record)
    }

    /// Read-decide-write loop shared by every mutation.
    async fn update<T, F>(&self, task_id: &str, mut decide: F) -> Result<(TaskRecord, T), TaskError>
    where
        T: Send,
        F: FnMut(&mut TaskRecord) -> Result<Decision<T>, TaskError> + Send,
    {
        let mut retries = 0;
        loop {
            let mut record = self.load(task_id).await?;
            let read_version = record.version;

            let out = match decide(&mut record)? {
                Decision::Skip(out) => return Ok((record, out)),
                Decision::Write(out) => out,
            };

            record.touch();
            let bytes = Self::serialize_record(&record)?;
            match self
                .backend
                .put_if_version(task_id, &bytes, read_version)
                .await
            {
                Ok(version) => {
                    record.version = version;
                    return Ok((record, out));
                }
                Err(StorageError::VersionConflict { actual, .. })
                    if retries < self.config.max_cas_retries =>
                {
                    retries += 1;
                    tracing::debug!(
                        task_id = task_id,
                        read_version,
                        actual_version = actual,
                        retries,
                        "lost compare-and-swap, re-validating"
                    );
                }
                Err(e) => return Err(Self::map_storage_error(e, task_id)),
            }
        }
    }

    // ---- Domain operations (public) ----

    /// Stores a freshly created record. Fails if the id is already taken.
    pub async fn insert(&self, mut record: TaskRecord) -> Result<TaskRecord, TaskError> {
        let bytes = Self::serialize_record(&record)?;
        record.version = self
            .backend
            .insert(&record.task_id, &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, &record.task_id))?;
        Ok(record)
    }

    /// Retrieves a task by id.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.load(task_id).await
    }

    /// Claims a task for `worker_id`. See [`TaskRegistry::claim`](crate::store::TaskRegistry::claim).
    pub async fn claim(
        &self,
        task_id: &str,
        worker_id: &str,
        redelivered: bool,
    ) -> Result<ClaimOutcome, TaskError> {
        let (record, state) = self
            .update(task_id, |record| {
                if record.is_terminal() {
                    return Ok(Decision::Skip(ClaimState::AlreadyTerminal));
                }
                if record.status == TaskStatus::Running && !redelivered {
                    return Ok(Decision::Skip(ClaimState::HeldElsewhere));
                }
                record
                    .status
                    .validate_transition(task_id, &TaskStatus::Running)?;
                record.status = TaskStatus::Running;
                record.attempt += 1;
                record.claimed_by = Some(worker_id.to_string());
                Ok(Decision::Write(ClaimState::Claimed))
            })
            .await?;

        Ok(match state {
            ClaimState::Claimed => {
                if record.attempt > 1 {
                    tracing::warn!(
                        task_id = task_id,
                        worker_id = worker_id,
                        attempt = record.attempt,
                        "took over claim of redelivered task"
                    );
                }
                ClaimOutcome::Claimed(record)
            }
            ClaimState::AlreadyTerminal => ClaimOutcome::AlreadyTerminal(record),
            ClaimState::HeldElsewhere => ClaimOutcome::HeldElsewhere(record),
        })
    }

    /// Replaces the progress of a running task.
    ///
    /// Enforces [`RegistryConfig::max_progress_bytes`]. Fails with
    /// [`TaskError::InvalidTransition`] unless the task is running and with
    /// [`TaskError::ClaimLost`] unless `worker_id` holds the claim.
    pub async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress: TaskProgress,
    ) -> Result<TaskRecord, TaskError> {
        let progress = progress.normalized();
        let size = serde_json::to_vec(&progress)
            .map_err(|e| TaskError::Serialization(format!("failed to serialize progress: {e}")))?
            .len();
        if size > self.config.max_progress_bytes {
            return Err(TaskError::ProgressTooLarge {
                limit_bytes: self.config.max_progress_bytes,
                actual_bytes: size,
            });
        }

        let (record, ()) = self
            .update(task_id, |record| {
                record
                    .status
                    .validate_transition(task_id, &TaskStatus::Running)?;
                ensure_claim_holder(record, task_id, worker_id, None)?;
                record.progress = Some(progress.clone());
                Ok(Decision::Write(()))
            })
            .await?;
        Ok(record)
    }

    /// Completes a running task. See [`TaskRegistry::complete`](crate::store::TaskRegistry::complete).
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        status: TaskStatus,
        result_ref: String,
    ) -> Result<TaskRecord, TaskError> {
        let (record, ()) = self
            .update(task_id, |record| {
                if !status.is_terminal() || record.result_ref.is_some() {
                    return Err(TaskError::InvalidTransition {
                        task_id: task_id.to_string(),
                        from: record.status,
                        to: status,
                    });
                }
                record.status.validate_transition(task_id, &status)?;
                ensure_claim_holder(record, task_id, worker_id, Some(attempt))?;
                record.status = status;
                record.result_ref = Some(result_ref.clone());
                Ok(Decision::Write(()))
            })
            .await?;

        tracing::info!(
            task_id = task_id,
            worker_id = worker_id,
            attempt,
            status = %status,
            "task completed"
        );
        Ok(record)
    }

    /// Fails a pending or running task without a stored result.
    pub async fn fail(&self, task_id: &str, message: String) -> Result<TaskRecord, TaskError> {
        let (record, ()) = self
            .update(task_id, |record| {
                record
                    .status
                    .validate_transition(task_id, &TaskStatus::Failed)?;
                record.status = TaskStatus::Failed;
                record.status_message = Some(message.clone());
                Ok(Decision::Write(()))
            })
            .await?;

        tracing::warn!(task_id = task_id, reason = %message, "task marked failed");
        Ok(record)
    }

    /// Deletes a task. Returns `false` if it did not exist.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.backend
            .delete(task_id)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))
    }

    /// Lists every stored task id.
    pub async fn list_ids(&self) -> Result<Vec<String>, TaskError> {
        self.backend
            .list_keys()
            .await
            .map_err(|e| Self::map_storage_error(e, ""))
    }
}

fn ensure_claim_holder(
    record: &TaskRecord,
    task_id: &str,
    worker_id: &str,
    attempt: Option<u32>,
) -> Result<(), TaskError> {
    let holds_claim = record.claimed_by.as_deref() == Some(worker_id)
        && attempt.is_none_or(|a| a == record.attempt);
    if holds_claim {
        Ok(())
    } else {
        Err(TaskError::ClaimLost {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }
}

//! API-side task creation.
//!
//! [`Dispatcher::submit`] assigns the id, writes the `pending` registry entry
//! and publishes `{task_id, kind, payload}` to the work queue, in that order,
//! so the id exists before any worker can see the message. When publishing
//! fails the entry is reconciled before the error reaches the caller: deleted
//! if possible, otherwise marked failed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::BrokerTransport;
use crate::constants::{DEFAULT_CALL_TIMEOUT, DEFAULT_QUEUE};
use crate::domain::TaskRecord;
use crate::error::{with_timeout, Reconciliation, TaskError};
use crate::store::TaskRegistry;
use crate::types::message::TaskMessage;
use crate::types::task::TaskKind;

/// Creates tasks and publishes them to the broker.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use esg_tasks::broker::memory::InMemoryBroker;
/// use esg_tasks::dispatcher::Dispatcher;
/// use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
/// use esg_tasks::store::TaskRegistry;
/// use esg_tasks::{TaskKind, TaskStatus};
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
/// let broker = Arc::new(InMemoryBroker::new());
/// let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
///
/// let task_id = dispatcher
///     .submit(TaskKind::Request, json!({"x": [[1.0]]}))
///     .await
///     .unwrap();
///
/// assert_eq!(registry.get(&task_id).await.unwrap().status, TaskStatus::Pending);
/// assert_eq!(broker.queue_len("tasks"), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn TaskRegistry>,
    broker: Arc<dyn BrokerTransport>,
    queue: String,
    call_timeout: Duration,
    enabled_kinds: Vec<TaskKind>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue)
            .field("call_timeout", &self.call_timeout)
            .field("enabled_kinds", &self.enabled_kinds)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher publishing every kind to [`DEFAULT_QUEUE`].
    pub fn new(registry: Arc<dyn TaskRegistry>, broker: Arc<dyn BrokerTransport>) -> Self {
        Self {
            registry,
            broker,
            queue: DEFAULT_QUEUE.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            enabled_kinds: TaskKind::ALL.to_vec(),
        }
    }

    /// Publishes to `queue` instead of the default work queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Deadline for each registry and broker call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Restricts submissions to `kinds`. Others fail with
    /// [`TaskError::UnsupportedKind`].
    pub fn with_enabled_kinds(mut self, kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        self.enabled_kinds = kinds.into_iter().collect();
        self
    }

    /// Whether `kind` is accepted.
    pub fn is_enabled(&self, kind: TaskKind) -> bool {
        self.enabled_kinds.contains(&kind)
    }

    /// The work queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Submits a task and returns its id.
    ///
    /// The payload is forwarded unchanged.
    ///
    /// # Errors
    ///
    /// - [`TaskError::UnsupportedKind`] if the kind is disabled.
    /// - [`TaskError::DispatchFailure`] if publishing failed; the registry
    ///   entry was already reconciled.
    /// - Registry errors if the entry could not be created. Nothing was
    ///   published in that case.
    pub async fn submit(&self, kind: TaskKind, payload: Value) -> Result<String, TaskError> {
        if !self.is_enabled(kind) {
            return Err(TaskError::UnsupportedKind { kind });
        }

        let record = with_timeout(
            "registry insert",
            self.call_timeout,
            self.registry.insert(TaskRecord::new(kind)),
        )
        .await?;
        let task_id = record.task_id;

        let message = TaskMessage::new(task_id.clone(), kind, payload);
        let published = with_timeout(
            "broker enqueue",
            self.call_timeout,
            self.broker.enqueue(&self.queue, &message),
        )
        .await;

        match published {
            Ok(()) => {
                tracing::info!(task_id = %task_id, kind = %kind, queue = %self.queue, "task submitted");
                Ok(task_id)
            }
            Err(cause) => Err(self.reconcile(task_id, cause).await),
        }
    }

    /// Like [`submit`](Self::submit) with the kind given as a string.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnknownKind`] if `kind` names no known kind.
    pub async fn submit_raw(&self, kind: &str, payload: Value) -> Result<String, TaskError> {
        let kind: TaskKind = kind.parse()?;
        self.submit(kind, payload).await
    }

    async fn reconcile(&self, task_id: String, cause: TaskError) -> TaskError {
        let reason = cause.to_string();
        tracing::warn!(task_id = %task_id, error = %cause, "publish failed, reconciling registry entry");

        let reconciliation = match with_timeout(
            "registry delete",
            self.call_timeout,
            self.registry.delete(&task_id),
        )
        .await
        {
            Ok(_) => Reconciliation::RolledBack,
            Err(delete_err) => {
                tracing::warn!(task_id = %task_id, error = %delete_err, "rollback failed, marking task failed");
                match with_timeout(
                    "registry fail",
                    self.call_timeout,
                    self.registry
                        .fail(&task_id, format!("dispatch failed: {reason}")),
                )
                .await
                {
                    Ok(_) => Reconciliation::MarkedFailed,
                    Err(fail_err) => {
                        tracing::error!(
                            task_id = %task_id,
                            error = %fail_err,
                            "could not reconcile task after failed publish"
                        );
                        Reconciliation::Unresolved
                    }
                }
            }
        };

        TaskError::DispatchFailure {
            task_id,
            reconciliation,
            reason,
        }
    }
}

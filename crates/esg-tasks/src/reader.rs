//! API-side status and result queries.
//!
//! Readers only ever read. Each call is a bounded registry read, plus one
//! bounded result-store read for [`StatusReader::get_result`]; nothing waits
//! for a worker.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::broker::{BrokerError, BrokerTransport};
use crate::constants::DEFAULT_CALL_TIMEOUT;
use crate::domain::TaskRecord;
use crate::error::{with_timeout, TaskError};
use crate::store::TaskRegistry;
use crate::types::outcome::{ComputationError, StatusReport, TaskOutcome};
use crate::types::task::TaskStatus;

/// Reader tuning.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Deadline for each registry or broker call. Default 5 s.
    pub call_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Answers status polls and result requests.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use esg_tasks::broker::memory::InMemoryBroker;
/// use esg_tasks::dispatcher::Dispatcher;
/// use esg_tasks::reader::StatusReader;
/// use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
/// use esg_tasks::{TaskError, TaskKind, TaskStatus};
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
/// let broker = Arc::new(InMemoryBroker::new());
/// let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
/// let reader = StatusReader::new(registry, broker);
///
/// let id = dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
/// assert_eq!(reader.get_status(&id).await.unwrap().status, TaskStatus::Pending);
/// assert!(matches!(
///     reader.get_result(&id).await,
///     Err(TaskError::NotReady { .. })
/// ));
/// # });
/// ```
#[derive(Clone)]
pub struct StatusReader {
    registry: Arc<dyn TaskRegistry>,
    broker: Arc<dyn BrokerTransport>,
    config: ReaderConfig,
}

impl std::fmt::Debug for StatusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StatusReader {
    /// Creates a reader with default configuration.
    pub fn new(registry: Arc<dyn TaskRegistry>, broker: Arc<dyn BrokerTransport>) -> Self {
        Self {
            registry,
            broker,
            config: ReaderConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Latest known state of the task.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for ids that were never issued or whose task
    /// was collected. [`TaskError::Timeout`] when the registry is too slow.
    pub async fn get_status(&self, task_id: &str) -> Result<StatusReport, TaskError> {
        let record = self.load(task_id).await?;
        tracing::debug!(task_id = task_id, status = %record.status, "status read");
        Ok(StatusReport::from(&record))
    }

    /// Final payload of a terminal task.
    ///
    /// A failed task yields [`TaskOutcome::Failed`] with the recorded error
    /// detail, through the same call as a success.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotReady`] while the task is pending or running.
    /// - [`TaskError::NotFound`] for unknown or collected tasks.
    /// - [`TaskError::Timeout`] when the registry or broker is too slow.
    pub async fn get_result(&self, task_id: &str) -> Result<TaskOutcome, TaskError> {
        let record = self.load(task_id).await?;
        if !record.is_terminal() {
            return Err(TaskError::NotReady {
                task_id: task_id.to_string(),
                status: record.status,
            });
        }

        let Some(key) = record.result_ref.as_deref() else {
            return match record.status {
                TaskStatus::Failed => Ok(TaskOutcome::Failed(ComputationError::with_code(
                    "task_failed",
                    record
                        .status_message
                        .clone()
                        .unwrap_or_else(|| "task failed".to_string()),
                ))),
                _ => Err(TaskError::Store(format!(
                    "task {task_id} is {} without a result reference",
                    record.status
                ))),
            };
        };

        let payload = match with_timeout(
            "fetch result",
            self.config.call_timeout,
            self.broker.fetch_result(key),
        )
        .await
        {
            Ok(payload) => payload,
            // Collected between the registry read and the fetch.
            Err(TaskError::Broker(BrokerError::NotFound { .. })) => {
                return Err(TaskError::NotFound {
                    task_id: task_id.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        Ok(match record.status {
            TaskStatus::Failed => TaskOutcome::Failed(
                serde_json::from_value(payload.clone())
                    .unwrap_or_else(|_| ComputationError::new(payload.to_string())),
            ),
            _ => TaskOutcome::Ready(payload),
        })
    }

    async fn load(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        if Uuid::parse_str(task_id).is_err() {
            return Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        with_timeout(
            "registry get",
            self.config.call_timeout,
            self.registry.get(task_id),
        )
        .await
    }
}

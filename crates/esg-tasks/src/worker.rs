//! Worker Loop: pulls tasks from the broker and executes them.
//!
//! # Execution of one delivery
//!
//! 1. Claim the task in the registry. Terminal tasks, tasks claimed by a
//!    live executor and tasks with no registry entry are acknowledged
//!    without running anything.
//! 2. Run the computation registered for the task's kind on its own tokio
//!    task. An error or a panic becomes a [`ComputationError`] result.
//! 3. Store the result payload under `"{task_id}.{attempt}"`, then complete
//!    the task with that reference. If the claim was lost in the meantime
//!    the stored payload is deleted again.
//! 4. Acknowledge the delivery.
//!
//! Registry or broker failures abort the sequence before the ack, so the
//! transport delivers the message again. Computation errors never do.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::BrokerTransport;
use crate::constants::{
    DEFAULT_DEQUEUE_WAIT, DEFAULT_ERROR_BACKOFF, DEFAULT_QUEUE, DEFAULT_WORKER_CONCURRENCY,
};
use crate::context::TaskContext;
use crate::domain::{result_key, TaskRecord};
use crate::error::TaskError;
use crate::store::{ClaimOutcome, TaskRegistry};
use crate::types::message::Delivery;
use crate::types::outcome::{ComputationError, TaskOutcome};
use crate::types::task::{TaskKind, TaskStatus};

/// A computation callback for one task kind.
///
/// Receives the payload exactly as submitted. Returning `Err` fails the task
/// with the error as its result payload.
#[async_trait]
pub trait Computation: Send + Sync {
    /// Runs the computation.
    async fn compute(&self, payload: Value, ctx: TaskContext) -> Result<Value, ComputationError>;
}

/// [`Computation`] backed by an async closure. Built by [`computation_fn`].
pub struct FnComputation<F> {
    f: F,
}

/// Wraps an async closure as a [`Computation`].
///
/// # Examples
///
/// ```
/// use esg_tasks::worker::{computation_fn, Computations};
/// use esg_tasks::TaskKind;
/// use serde_json::json;
///
/// let computations = Computations::new(computation_fn(|payload, _ctx| async move {
///     Ok(json!({"echo": payload}))
/// }));
/// assert!(computations.supports(TaskKind::Request));
/// assert!(!computations.supports(TaskKind::FitParameters));
/// ```
pub fn computation_fn<F, Fut>(f: F) -> FnComputation<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ComputationError>> + Send,
{
    FnComputation { f }
}

#[async_trait]
impl<F, Fut> Computation for FnComputation<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ComputationError>> + Send,
{
    async fn compute(&self, payload: Value, ctx: TaskContext) -> Result<Value, ComputationError> {
        (self.f)(payload, ctx).await
    }
}

/// The computation table, one slot per [`TaskKind`].
///
/// `request` is mandatory. `fit-parameters` is optional; its tasks fail with
/// an `unsupported_kind` error when no callback is registered.
#[derive(Clone)]
pub struct Computations {
    request: Arc<dyn Computation>,
    fit_parameters: Option<Arc<dyn Computation>>,
}

impl Computations {
    /// Table serving only `request` tasks.
    pub fn new(request: impl Computation + 'static) -> Self {
        Self {
            request: Arc::new(request),
            fit_parameters: None,
        }
    }

    /// Registers the `fit-parameters` callback.
    pub fn with_fit_parameters(mut self, fit_parameters: impl Computation + 'static) -> Self {
        self.fit_parameters = Some(Arc::new(fit_parameters));
        self
    }

    /// The callback for `kind`, if registered.
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Computation>> {
        match kind {
            TaskKind::Request => Some(Arc::clone(&self.request)),
            TaskKind::FitParameters => self.fit_parameters.clone(),
        }
    }

    /// Whether `kind` has a callback.
    pub fn supports(&self, kind: TaskKind) -> bool {
        self.get(kind).is_some()
    }
}

/// Worker loop tuning.
///
/// # Defaults
///
/// | Setting         | Default  | Description                                  |
/// |-----------------|----------|----------------------------------------------|
/// | `queue`         | `tasks`  | Work queue to consume                        |
/// | `concurrency`   | 4        | Tasks executed at the same time              |
/// | `dequeue_wait`  | 1 s      | Blocking wait on an empty queue              |
/// | `error_backoff` | 500 ms   | Pause after a transport error                |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Work queue to consume.
    pub queue: String,
    /// Upper bound on concurrently executing tasks.
    pub concurrency: usize,
    /// How long one dequeue blocks waiting for a message.
    pub dequeue_wait: Duration,
    /// Pause after the transport returned an error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            dequeue_wait: DEFAULT_DEQUEUE_WAIT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

/// What handling one delivery amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The computation ran and the task reached `status`.
    Completed {
        /// The task.
        task_id: String,
        /// `Ready` or `Failed`.
        status: TaskStatus,
    },
    /// The task was already terminal; the callback was not invoked.
    SkippedTerminal {
        /// The task.
        task_id: String,
    },
    /// Another worker holds the claim; the callback was not invoked.
    SkippedClaimed {
        /// The task.
        task_id: String,
    },
    /// The message refers to no registry entry.
    Orphaned {
        /// The unknown task id.
        task_id: String,
    },
    /// The computation ran, but the claim was taken over or the task failed
    /// before completion. Its result was discarded.
    Superseded {
        /// The task.
        task_id: String,
    },
}

impl ProcessOutcome {
    /// The task the delivery referred to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Completed { task_id, .. }
            | Self::SkippedTerminal { task_id }
            | Self::SkippedClaimed { task_id }
            | Self::Orphaned { task_id }
            | Self::Superseded { task_id } => task_id,
        }
    }
}

/// Consumes the work queue and executes tasks.
///
/// Cloning is cheap; clones share the registry, broker and computations and
/// act as the same worker.
#[derive(Clone)]
pub struct WorkerLoop {
    registry: Arc<dyn TaskRegistry>,
    broker: Arc<dyn BrokerTransport>,
    computations: Computations,
    config: WorkerConfig,
    worker_id: String,
}

impl std::fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerLoop {
    /// Creates a worker with a random id and default configuration.
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        broker: Arc<dyn BrokerTransport>,
        computations: Computations,
    ) -> Self {
        Self {
            registry,
            broker,
            computations,
            config: WorkerConfig::default(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the id recorded as `claimed_by`.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// The id recorded as `claimed_by`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The active configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Takes one message off the queue without waiting and handles it.
    ///
    /// Returns `Ok(None)` if the queue was empty.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>, TaskError> {
        match self.broker.dequeue(&self.config.queue, None).await? {
            Some(delivery) => self.handle_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handles one delivery. See the module documentation for the sequence.
    ///
    /// # Errors
    ///
    /// Registry and broker failures. The delivery is not acknowledged in
    /// that case.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<ProcessOutcome, TaskError> {
        let task_id = delivery.message.task_id.clone();

        let claim = match self
            .registry
            .claim(&task_id, &self.worker_id, delivery.redelivered)
            .await
        {
            Ok(claim) => claim,
            Err(TaskError::NotFound { .. }) => {
                tracing::warn!(task_id = %task_id, "message for unknown task, dropping");
                self.ack(&delivery).await;
                return Ok(ProcessOutcome::Orphaned { task_id });
            }
            Err(e) => return Err(e),
        };

        let record = match claim {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::AlreadyTerminal(record) => {
                tracing::debug!(task_id = %task_id, status = %record.status, "task already terminal, skipping");
                self.ack(&delivery).await;
                return Ok(ProcessOutcome::SkippedTerminal { task_id });
            }
            ClaimOutcome::HeldElsewhere(record) => {
                tracing::debug!(
                    task_id = %task_id,
                    claimed_by = record.claimed_by.as_deref().unwrap_or_default(),
                    "task claimed by another worker, skipping"
                );
                self.ack(&delivery).await;
                return Ok(ProcessOutcome::SkippedClaimed { task_id });
            }
        };

        if record.kind != delivery.message.kind {
            tracing::warn!(
                task_id = %task_id,
                registry_kind = %record.kind,
                message_kind = %delivery.message.kind,
                "message kind disagrees with registry, using registry kind"
            );
        }
        tracing::info!(
            task_id = %task_id,
            kind = %record.kind,
            worker_id = %self.worker_id,
            attempt = record.attempt,
            "task started"
        );

        let outcome = self
            .execute(&record, delivery.message.payload.clone())
            .await;
        let status = outcome.status();
        let key = result_key(&task_id, record.attempt);

        self.broker.store_result(&key, &outcome.to_payload()).await?;

        let completed = self
            .registry
            .complete(&task_id, &self.worker_id, record.attempt, status, key.clone())
            .await;

        match completed {
            Ok(_) => {
                self.ack(&delivery).await;
                Ok(ProcessOutcome::Completed { task_id, status })
            }
            Err(
                TaskError::ClaimLost { .. }
                | TaskError::InvalidTransition { .. }
                | TaskError::NotFound { .. },
            ) => {
                tracing::warn!(
                    task_id = %task_id,
                    attempt = record.attempt,
                    "claim lost before completion, discarding result"
                );
                self.discard_result(&key).await;
                self.ack(&delivery).await;
                Ok(ProcessOutcome::Superseded { task_id })
            }
            Err(e) => {
                self.discard_result(&key).await;
                Err(e)
            }
        }
    }

    /// Runs until `shutdown` is cancelled, then waits for in-flight tasks.
    ///
    /// At most `concurrency` tasks execute at once; the loop only dequeues
    /// when a slot is free.
    pub async fn run(&self, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        tracing::info!(
            worker_id = %self.worker_id,
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            "worker loop started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Relies on `dequeue` being cancel-safe.
            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.broker.dequeue(&self.config.queue, Some(self.config.dequeue_wait)) => dequeued,
            };

            match dequeued {
                Ok(Some(delivery)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let task_id = delivery.message.task_id.clone();
                        if let Err(e) = worker.handle_delivery(delivery).await {
                            tracing::error!(task_id = %task_id, error = %e, "task handling failed, leaving message for redelivery");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_join_error(joined);
            }
        }

        tracing::info!(worker_id = %self.worker_id, pending = in_flight.len(), "worker loop draining");
        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }
        tracing::info!(worker_id = %self.worker_id, "worker loop stopped");
    }

    async fn execute(&self, record: &TaskRecord, payload: Value) -> TaskOutcome {
        let Some(computation) = self.computations.get(record.kind) else {
            tracing::warn!(task_id = %record.task_id, kind = %record.kind, "no computation registered");
            return TaskOutcome::Failed(ComputationError::unsupported_kind(record.kind));
        };
        let ctx = TaskContext::new(Arc::clone(&self.registry), record, self.worker_id.clone());

        let joined = tokio::spawn(async move { computation.compute(payload, ctx).await }).await;
        match joined {
            Ok(Ok(value)) => TaskOutcome::Ready(value),
            Ok(Err(err)) => {
                tracing::info!(task_id = %record.task_id, error = %err, "computation failed");
                TaskOutcome::Failed(err)
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                tracing::error!(task_id = %record.task_id, panic = %message, "computation panicked");
                TaskOutcome::Failed(ComputationError::panicked(message))
            }
            Err(join) => {
                TaskOutcome::Failed(ComputationError::new(format!("computation aborted: {join}")))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            tracing::warn!(task_id = %delivery.message.task_id, error = %e, "ack failed");
        }
    }

    async fn discard_result(&self, key: &str) {
        if let Err(e) = self.broker.delete_result(key).await {
            tracing::warn!(key = key, error = %e, "could not delete orphaned result");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "computation panicked".to_string()
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "task handler did not finish");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::dispatcher::Dispatcher;
    use crate::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
    use serde_json::json;

    fn echo() -> Computations {
        Computations::new(computation_fn(|payload, _ctx| async move { Ok(payload) }))
    }

    #[tokio::test]
    async fn completes_and_acks() {
        let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
        let worker = WorkerLoop::new(registry.clone(), broker.clone(), echo()).with_worker_id("w");

        let id = dispatcher.submit(TaskKind::Request, json!([1])).await.unwrap();
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                task_id: id.clone(),
                status: TaskStatus::Ready
            }
        );
        assert_eq!(broker.in_flight_len(), 0);

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.result_ref.as_deref(), Some(result_key(&id, 1).as_str()));
        assert_eq!(record.claimed_by.as_deref(), Some("w"));
        assert!(worker.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_callback_fails_task() {
        let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
        let worker = WorkerLoop::new(registry.clone(), broker.clone(), echo());

        let id = dispatcher
            .submit(TaskKind::FitParameters, json!({}))
            .await
            .unwrap();
        worker.process_next().await.unwrap();

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let payload = broker
            .fetch_result(record.result_ref.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(payload["code"], "unsupported_kind");
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "computation panicked");
    }
}

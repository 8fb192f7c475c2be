//! Worker loop behaviour under at-least-once delivery: redelivery of
//! finished tasks, takeover of abandoned claims, concurrency limits and
//! graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use esg_tasks::broker::memory::InMemoryBroker;
use esg_tasks::broker::{BrokerError, BrokerTransport};
use esg_tasks::domain::result_key;
use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
use esg_tasks::store::TaskRegistry;
use esg_tasks::{
    computation_fn, Computation, ComputationError, Computations, Delivery, Dispatcher,
    ProcessOutcome, TaskContext, TaskError, TaskKind, TaskMessage, TaskStatus, WorkerConfig,
    WorkerLoop,
};

/// Counts invocations and echoes the payload.
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Computation for Counting {
    async fn compute(&self, payload: Value, _ctx: TaskContext) -> Result<Value, ComputationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}

fn setup() -> (Arc<InMemoryTaskRegistry>, Arc<InMemoryBroker>, Dispatcher) {
    let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
    let broker = Arc::new(InMemoryBroker::new());
    let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
    (registry, broker, dispatcher)
}

mod redelivery {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn redelivered_finished_task_is_a_no_op() {
        let (registry, broker, dispatcher) = setup();
        let counting = Arc::new(Counting::default());
        let worker = WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(ArcComputation(counting.clone())),
        );

        let id = dispatcher.submit(TaskKind::Request, json!({"p": 1})).await.unwrap();
        worker.process_next().await.unwrap();
        let before = registry.get(&id).await.unwrap();

        for redelivered in [false, true] {
            let outcome = worker
                .handle_delivery(Delivery {
                    queue: "tasks".into(),
                    message: TaskMessage::new(id.clone(), TaskKind::Request, json!({"p": 1})),
                    receipt: "dup".into(),
                    redelivered,
                })
                .await
                .unwrap();
            assert_eq!(outcome, ProcessOutcome::SkippedTerminal { task_id: id.clone() });
        }

        let after = registry.get(&id).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.status, before.status);
        assert_eq!(after.result_ref, before.result_ref);
        assert_eq!(after.version, before.version);
        assert_eq!(broker.result_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_while_running_is_skipped() {
        let (registry, broker, dispatcher) = setup();
        let id = dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
        registry.claim(&id, "other-worker", false).await.unwrap();

        let worker = WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        );
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::SkippedClaimed { task_id: id.clone() });
        assert_eq!(broker.in_flight_len(), 0);
        assert_eq!(registry.get(&id).await.unwrap().claimed_by.as_deref(), Some("other-worker"));
    }

    #[tokio::test]
    async fn crashed_worker_is_taken_over_on_redelivery() {
        let (registry, broker, dispatcher) = setup();
        let id = dispatcher.submit(TaskKind::Request, json!({"v": 7})).await.unwrap();

        // First consumer takes the message, claims the task and dies.
        let lost = broker.dequeue("tasks", None).await.unwrap().unwrap();
        registry.claim(&id, "crashed", lost.redelivered).await.unwrap();
        assert_eq!(broker.recover_unacked(), 1);

        let worker = WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        )
        .with_worker_id("rescuer");
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                task_id: id.clone(),
                status: TaskStatus::Ready
            }
        );

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.attempt, 2);
        assert_eq!(record.claimed_by.as_deref(), Some("rescuer"));
        assert_eq!(record.result_ref, Some(result_key(&id, 2)));

        // The crashed worker coming back cannot overwrite the result.
        let err = registry
            .complete(&id, "crashed", 1, TaskStatus::Failed, result_key(&id, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn superseded_execution_discards_its_result() {
        let (registry, broker, dispatcher) = setup();
        let id = dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();

        let registry_dyn: Arc<dyn TaskRegistry> = registry.clone();
        let hijack_id = id.clone();
        let worker = WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(computation_fn(move |_p, _ctx| {
                let registry = registry_dyn.clone();
                let id = hijack_id.clone();
                async move {
                    // Another worker takes over while this one computes.
                    registry.claim(&id, "usurper", true).await.unwrap();
                    Ok(json!("stale"))
                }
            })),
        );

        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::Superseded { task_id: id.clone() });
        assert_eq!(broker.result_count(), 0);
        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.claimed_by.as_deref(), Some("usurper"));
        assert!(record.result_ref.is_none());
    }

    #[tokio::test]
    async fn message_without_registry_entry_is_dropped() {
        let (registry, broker, _dispatcher) = setup();
        broker
            .enqueue(
                "tasks",
                &TaskMessage::new(uuid::Uuid::now_v7().to_string(), TaskKind::Request, json!({})),
            )
            .await
            .unwrap();
        let worker = WorkerLoop::new(
            registry,
            broker.clone(),
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        );
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Orphaned { .. }));
        assert_eq!(broker.in_flight_len(), 0);
    }
}

mod infrastructure_failures {
    use super::*;

    /// Delegates to an in-memory broker but refuses to store results.
    struct NoResultStore(InMemoryBroker);

    #[async_trait]
    impl BrokerTransport for NoResultStore {
        async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<(), BrokerError> {
            self.0.enqueue(queue, message).await
        }
        async fn dequeue(
            &self,
            queue: &str,
            wait: Option<Duration>,
        ) -> Result<Option<Delivery>, BrokerError> {
            self.0.dequeue(queue, wait).await
        }
        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.0.ack(delivery).await
        }
        async fn store_result(&self, _key: &str, _payload: &Value) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable {
                message: "result store offline".into(),
            })
        }
        async fn fetch_result(&self, key: &str) -> Result<Value, BrokerError> {
            self.0.fetch_result(key).await
        }
        async fn delete_result(&self, key: &str) -> Result<bool, BrokerError> {
            self.0.delete_result(key).await
        }
    }

    #[tokio::test]
    async fn result_store_failure_leaves_message_unacked() {
        let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
        let broker = Arc::new(NoResultStore(InMemoryBroker::new()));
        let dispatcher = Dispatcher::new(registry.clone(), broker.clone());
        let worker = WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        );

        let id = dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
        let err = worker.process_next().await.unwrap_err();
        assert!(matches!(err, TaskError::Broker(BrokerError::Unavailable { .. })));
        assert_eq!(err.http_status(), 503);

        assert_eq!(broker.0.in_flight_len(), 1);
        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.result_ref.is_none());
    }
}

mod run_loop {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_limit_is_respected() {
        let (registry, broker, dispatcher) = setup();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let computations = {
            let active = active.clone();
            let peak = peak.clone();
            Computations::new(computation_fn(move |p, _| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(p)
                }
            }))
        };

        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(dispatcher.submit(TaskKind::Request, json!(i)).await.unwrap());
        }

        let worker = WorkerLoop::new(registry.clone(), broker.clone(), computations).with_config(
            WorkerConfig {
                concurrency: 3,
                dequeue_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let mut done = 0;
            for id in &ids {
                if registry.get(id).await.unwrap().status == TaskStatus::Ready {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "tasks did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "tasks never overlapped");
        assert_eq!(broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_tasks() {
        let (registry, broker, dispatcher) = setup();
        let started = Arc::new(Notify::new());
        let computations = {
            let started = started.clone();
            Computations::new(computation_fn(move |p, _| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(p)
                }
            }))
        };
        let id = dispatcher.submit(TaskKind::Request, json!("slow")).await.unwrap();

        let worker = WorkerLoop::new(registry.clone(), broker.clone(), computations);
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        started.notified().await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(registry.get(&id).await.unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn idle_loop_stops_promptly() {
        let (registry, broker, _dispatcher) = setup();
        let worker = WorkerLoop::new(
            registry,
            broker,
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        )
        .with_config(WorkerConfig {
            dequeue_wait: Duration::from_secs(30),
            ..WorkerConfig::default()
        });
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker loop did not stop")
            .unwrap();
    }
}

/// Lets a test keep a handle on a computation registered in the table.
struct ArcComputation<C>(Arc<C>);

#[async_trait]
impl<C: Computation> Computation for ArcComputation<C> {
    async fn compute(&self, payload: Value, ctx: TaskContext) -> Result<Value, ComputationError> {
        self.0.compute(payload, ctx).await
    }
}

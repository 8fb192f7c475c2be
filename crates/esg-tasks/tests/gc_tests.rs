//! Garbage collection: retention of terminal tasks, stale-task policies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use esg_tasks::broker::memory::InMemoryBroker;
use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
use esg_tasks::{
    computation_fn, Computations, Dispatcher, GarbageCollector, GcConfig, ProcessOutcome,
    StaleTaskPolicy, StatusReader, TaskError, TaskKind, TaskStatus, WorkerLoop,
};

const HOUR: Duration = Duration::from_secs(3600);

struct Env {
    registry: Arc<InMemoryTaskRegistry>,
    broker: Arc<InMemoryBroker>,
    dispatcher: Dispatcher,
    reader: StatusReader,
    worker: WorkerLoop,
}

fn env() -> Env {
    let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
    let broker = Arc::new(InMemoryBroker::new());
    Env {
        dispatcher: Dispatcher::new(registry.clone(), broker.clone()),
        reader: StatusReader::new(registry.clone(), broker.clone()),
        worker: WorkerLoop::new(
            registry.clone(),
            broker.clone(),
            Computations::new(computation_fn(|p, _| async move { Ok(p) })),
        ),
        registry,
        broker,
    }
}

impl Env {
    fn gc(&self, config: GcConfig) -> GarbageCollector {
        GarbageCollector::new(self.registry.clone(), self.broker.clone()).with_config(config)
    }

    async fn finished_task(&self) -> String {
        let id = self
            .dispatcher
            .submit(TaskKind::Request, json!({"n": 1}))
            .await
            .unwrap();
        self.worker.process_next().await.unwrap();
        id
    }
}

fn retention(retention: Duration) -> GcConfig {
    GcConfig {
        retention,
        ..GcConfig::default()
    }
}

#[tokio::test]
async fn expired_terminal_task_and_result_are_collected() {
    let env = env();
    let id = env.finished_task().await;
    assert_eq!(env.broker.result_count(), 1);

    let report = env
        .gc(retention(HOUR))
        .sweep_at(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.collected, 1);
    assert_eq!(report.errors, 0);

    assert_eq!(env.broker.result_count(), 0);
    assert!(matches!(
        env.reader.get_status(&id).await,
        Err(TaskError::NotFound { .. })
    ));
    assert!(matches!(
        env.reader.get_result(&id).await,
        Err(TaskError::NotFound { .. })
    ));
}

#[tokio::test]
async fn young_terminal_task_is_kept() {
    let env = env();
    let id = env.finished_task().await;

    let report = env
        .gc(retention(HOUR))
        .sweep_at(Utc::now() + chrono::Duration::minutes(59))
        .await
        .unwrap();
    assert_eq!(report.collected, 0);
    assert_eq!(
        env.reader.get_status(&id).await.unwrap().status,
        TaskStatus::Ready
    );
}

#[tokio::test]
async fn retention_boundary_is_exclusive() {
    let env = env();
    let id = env.finished_task().await;
    let updated_at = env.registry.get(&id).await.unwrap().updated_at;

    let gc = env.gc(retention(HOUR));
    let exactly = updated_at + chrono::Duration::hours(1);
    assert_eq!(gc.sweep_at(exactly).await.unwrap().collected, 0);
    let just_after = exactly + chrono::Duration::milliseconds(1);
    assert_eq!(gc.sweep_at(just_after).await.unwrap().collected, 1);
}

#[tokio::test]
async fn non_terminal_tasks_survive_any_age_by_default() {
    let env = env();
    let pending = env.dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
    let running = env.dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
    env.registry.claim(&running, "w", false).await.unwrap();

    let report = env
        .gc(retention(Duration::from_secs(1)))
        .sweep_at(Utc::now() + chrono::Duration::days(3650))
        .await
        .unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.collected, 0);
    assert!(report.stuck.is_empty());
    assert!(env.reader.get_status(&pending).await.is_ok());
    assert!(env.reader.get_status(&running).await.is_ok());
}

#[tokio::test]
async fn report_policy_lists_stuck_tasks_without_touching_them() {
    let env = env();
    let id = env.dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
    env.registry.claim(&id, "ghost", false).await.unwrap();

    let gc = env.gc(GcConfig {
        stale_policy: StaleTaskPolicy::Report { after: HOUR },
        ..GcConfig::default()
    });
    let report = gc
        .sweep_at(Utc::now() + chrono::Duration::hours(3))
        .await
        .unwrap();

    assert_eq!(report.stuck.len(), 1);
    let stuck = &report.stuck[0];
    assert_eq!(stuck.task_id, id);
    assert_eq!(stuck.claimed_by.as_deref(), Some("ghost"));
    assert!(stuck.idle_seconds >= 3 * 3600 - 1);
    assert_eq!(report.reclaimed, 0);
    assert_eq!(
        env.reader.get_status(&id).await.unwrap().status,
        TaskStatus::Running
    );
}

#[tokio::test]
async fn fail_after_policy_fails_stuck_task_and_late_completion_is_discarded() {
    let env = env();
    let id = env.dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();
    // The message is still queued; pretend its first consumer stalled.
    env.registry.claim(&id, "stalled", false).await.unwrap();

    let gc = env.gc(GcConfig {
        stale_policy: StaleTaskPolicy::FailAfter { after: HOUR },
        ..GcConfig::default()
    });
    let report = gc
        .sweep_at(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.reclaimed, 1);

    let status = env.reader.get_status(&id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert!(status.status_message.is_some());

    // Redelivery of the queued message finds a terminal task.
    let outcome = env.worker.process_next().await.unwrap().unwrap();
    assert_eq!(outcome, ProcessOutcome::SkippedTerminal { task_id: id });
}

#[tokio::test]
async fn sweep_collects_many_and_keeps_rest() {
    let env = env();
    let mut finished = Vec::new();
    for _ in 0..5 {
        finished.push(env.finished_task().await);
    }
    let open = env.dispatcher.submit(TaskKind::Request, json!({})).await.unwrap();

    let report = env
        .gc(retention(HOUR))
        .sweep_at(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(report.scanned, 6);
    assert_eq!(report.collected, 5);
    assert_eq!(env.registry.list_ids().await.unwrap(), vec![open]);
}

#[tokio::test(start_paused = true)]
async fn background_collector_eventually_removes_expired_tasks() {
    let env = env();
    let id = env.finished_task().await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = env
        .gc(GcConfig {
            interval: Duration::from_secs(1),
            retention: Duration::from_millis(1),
            stale_policy: StaleTaskPolicy::Ignore,
        })
        .spawn(shutdown.clone());

    // Paused time auto-advances while we sleep; wall-clock time still moves
    // a little, which is all the 1 ms retention needs.
    let mut gone = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        std::thread::sleep(Duration::from_millis(2));
        if env.registry.get(&id).await.is_err() {
            gone = true;
            break;
        }
    }
    shutdown.cancel();
    handle.await.unwrap();
    assert!(gone, "task was never collected");
}

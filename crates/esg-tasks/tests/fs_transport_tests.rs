//! The full protocol over the filesystem registry and broker, with the API
//! side and the worker side opening the shared directory independently, as
//! separate processes would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use esg_tasks::broker::fs::FsBroker;
use esg_tasks::broker::BrokerTransport;
use esg_tasks::store::fs::{FsBackend, FsTaskRegistry};
use esg_tasks::{
    computation_fn, ComputationError, Computations, Dispatcher, GarbageCollector, GcConfig,
    ProcessOutcome, StatusReader, TaskError, TaskKind, TaskOutcome, TaskProgress, TaskStatus,
    WorkerLoop,
};

struct Side {
    registry: Arc<FsTaskRegistry>,
    broker: Arc<FsBroker>,
}

async fn open(base: &Path) -> Side {
    Side {
        registry: Arc::new(FsTaskRegistry::new(
            FsBackend::open(base.join("registry")).await.unwrap(),
        )),
        broker: Arc::new(
            FsBroker::open(base.join("broker"))
                .await
                .unwrap()
                .with_poll_interval(Duration::from_millis(10)),
        ),
    }
}

fn computations() -> Computations {
    Computations::new(computation_fn(|payload, ctx| async move {
        ctx.report_progress(TaskProgress::percent(50.0)).await.ok();
        Ok(json!({"doubled": payload["x"].as_f64().unwrap_or_default() * 2.0}))
    }))
    .with_fit_parameters(computation_fn(|_payload, _ctx| async {
        Err(ComputationError::invalid_input("no observations"))
    }))
}

#[tokio::test]
async fn api_and_worker_processes_share_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let api = open(dir.path()).await;
    let worker_side = open(dir.path()).await;

    let dispatcher = Dispatcher::new(api.registry.clone(), api.broker.clone());
    let reader = StatusReader::new(api.registry.clone(), api.broker.clone());
    let worker = WorkerLoop::new(
        worker_side.registry.clone(),
        worker_side.broker.clone(),
        computations(),
    );

    let ok = dispatcher
        .submit(TaskKind::Request, json!({"x": 21.0}))
        .await
        .unwrap();
    let bad = dispatcher
        .submit(TaskKind::FitParameters, json!({}))
        .await
        .unwrap();
    assert_eq!(reader.get_status(&ok).await.unwrap().status, TaskStatus::Pending);

    for _ in 0..2 {
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    }
    assert!(worker.process_next().await.unwrap().is_none());

    assert_eq!(
        reader.get_result(&ok).await.unwrap(),
        TaskOutcome::Ready(json!({"doubled": 42.0}))
    );
    let TaskOutcome::Failed(err) = reader.get_result(&bad).await.unwrap() else {
        panic!("expected failure");
    };
    assert_eq!(err.code, "invalid_input");
}

#[tokio::test]
async fn unacked_delivery_survives_worker_restart() {
    let dir = tempfile::tempdir().unwrap();
    let api = open(dir.path()).await;
    let dispatcher = Dispatcher::new(api.registry.clone(), api.broker.clone());
    let id = dispatcher
        .submit(TaskKind::Request, json!({"x": 1.0}))
        .await
        .unwrap();

    {
        // A worker takes the message and the task, then crashes.
        let crashed = open(dir.path()).await;
        let delivery = crashed.broker.dequeue("tasks", None).await.unwrap().unwrap();
        crashed
            .registry
            .claim(&id, "crashed", delivery.redelivered)
            .await
            .unwrap();
    }

    let restarted = open(dir.path()).await;
    assert_eq!(
        restarted.broker.recover_unacked(Duration::ZERO).await.unwrap(),
        1
    );
    let worker = WorkerLoop::new(
        restarted.registry.clone(),
        restarted.broker.clone(),
        computations(),
    );
    let outcome = worker.process_next().await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Completed {
            status: TaskStatus::Ready,
            ..
        }
    ));
    assert_eq!(api.registry.get(&id).await.unwrap().attempt, 2);
}

#[tokio::test]
async fn gc_removes_files_of_expired_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let side = open(dir.path()).await;
    let dispatcher = Dispatcher::new(side.registry.clone(), side.broker.clone());
    let worker = WorkerLoop::new(side.registry.clone(), side.broker.clone(), computations());
    let id = dispatcher
        .submit(TaskKind::Request, json!({"x": 3.0}))
        .await
        .unwrap();
    worker.process_next().await.unwrap();

    let result_file = dir
        .path()
        .join("broker/results")
        .join(format!("{id}.1.json"));
    assert!(result_file.exists());

    let gc = GarbageCollector::new(side.registry.clone(), side.broker.clone()).with_config(
        GcConfig {
            retention: Duration::from_secs(60),
            ..GcConfig::default()
        },
    );
    let report = gc
        .sweep_at(chrono::Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.collected, 1);
    assert!(!result_file.exists());
    assert!(!dir.path().join("registry").join(format!("{id}.json")).exists());

    let reader = StatusReader::new(side.registry.clone(), side.broker.clone());
    assert!(matches!(
        reader.get_result(&id).await,
        Err(TaskError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_workers_execute_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let api = open(dir.path()).await;
    let dispatcher = Dispatcher::new(api.registry.clone(), api.broker.clone());
    let mut ids = Vec::new();
    for i in 0..16 {
        ids.push(
            dispatcher
                .submit(TaskKind::Request, json!({"x": f64::from(i)}))
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for n in 0..4 {
        let side = open(dir.path()).await;
        let worker = WorkerLoop::new(side.registry, side.broker, computations())
            .with_worker_id(format!("w{n}"));
        handles.push(tokio::spawn(async move {
            let mut completed = 0;
            while let Some(outcome) = worker.process_next().await.unwrap() {
                if matches!(outcome, ProcessOutcome::Completed { .. }) {
                    completed += 1;
                }
            }
            completed
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, ids.len());
    for id in &ids {
        let record = api.registry.get(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Ready);
        assert_eq!(record.attempt, 1);
    }
}

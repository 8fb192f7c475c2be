//! Registry behaviour that must hold for every storage backend.
//!
//! Each check is written once against `Arc<dyn TaskRegistry>` and run
//! against the in-memory and the filesystem backends.

use std::sync::Arc;

use esg_tasks::store::fs::{FsBackend, FsTaskRegistry};
use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
use esg_tasks::store::{ClaimOutcome, TaskRegistry};
use esg_tasks::{TaskError, TaskKind, TaskProgress, TaskRecord, TaskStatus};

async fn registries() -> Vec<(&'static str, Arc<dyn TaskRegistry>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let fs = FsTaskRegistry::new(FsBackend::open(dir.path()).await.unwrap());
    vec![
        (
            "memory",
            Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new())) as Arc<dyn TaskRegistry>,
            None,
        ),
        ("fs", Arc::new(fs), Some(dir)),
    ]
}

mod lifecycle {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn claim_progress_complete() {
        for (name, registry, _dir) in registries().await {
            let record = registry
                .insert(TaskRecord::new(TaskKind::Request))
                .await
                .unwrap();
            let id = record.task_id.clone();
            assert_eq!(record.version, 1, "{name}");

            let ClaimOutcome::Claimed(claimed) = registry.claim(&id, "w1", false).await.unwrap()
            else {
                panic!("{name}: expected claim");
            };
            assert_eq!(claimed.status, TaskStatus::Running);
            assert_eq!(claimed.attempt, 1);

            let progressed = registry
                .report_progress(&id, "w1", TaskProgress::percent(40.0).with_stage("fit"))
                .await
                .unwrap();
            assert_eq!(progressed.status, TaskStatus::Running, "{name}");

            let done = registry
                .complete(&id, "w1", 1, TaskStatus::Ready, format!("{id}.1"))
                .await
                .unwrap();
            assert_eq!(done.result_ref, Some(format!("{id}.1")), "{name}");
            assert_eq!(done.created_at, record.created_at);

            let stored = registry.get(&id).await.unwrap();
            assert_eq!(stored.status, TaskStatus::Ready, "{name}");
            assert_eq!(
                stored.progress.unwrap().stage.as_deref(),
                Some("fit"),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        for (name, registry, _dir) in registries().await {
            let id = registry
                .insert(TaskRecord::new(TaskKind::FitParameters))
                .await
                .unwrap()
                .task_id;
            registry.claim(&id, "w1", false).await.unwrap();
            registry
                .complete(&id, "w1", 1, TaskStatus::Failed, format!("{id}.1"))
                .await
                .unwrap();
            let frozen = registry.get(&id).await.unwrap();

            assert!(matches!(
                registry.claim(&id, "w2", true).await.unwrap(),
                ClaimOutcome::AlreadyTerminal(_)
            ));
            assert!(registry
                .complete(&id, "w1", 1, TaskStatus::Ready, "other".into())
                .await
                .is_err());
            assert!(registry.fail(&id, "late".into()).await.is_err());
            assert!(registry
                .report_progress(&id, "w1", TaskProgress::percent(1.0))
                .await
                .is_err());

            assert_eq!(registry.get(&id).await.unwrap(), frozen, "{name}");
        }
    }

    #[tokio::test]
    async fn delete_and_list() {
        for (name, registry, _dir) in registries().await {
            let a = registry
                .insert(TaskRecord::new(TaskKind::Request))
                .await
                .unwrap()
                .task_id;
            let b = registry
                .insert(TaskRecord::new(TaskKind::Request))
                .await
                .unwrap()
                .task_id;

            let mut ids = registry.list_ids().await.unwrap();
            ids.sort();
            let mut expected = vec![a.clone(), b.clone()];
            expected.sort();
            assert_eq!(ids, expected, "{name}");

            assert!(registry.delete(&a).await.unwrap());
            assert!(!registry.delete(&a).await.unwrap());
            assert!(matches!(
                registry.get(&a).await,
                Err(TaskError::NotFound { .. })
            ));
            assert_eq!(registry.list_ids().await.unwrap(), vec![b], "{name}");
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        for (name, registry, _dir) in registries().await {
            let record = TaskRecord::new(TaskKind::Request);
            registry.insert(record.clone()).await.unwrap();
            let err = registry.insert(record).await.unwrap_err();
            assert!(matches!(err, TaskError::Store(_)), "{name}: {err:?}");
        }
    }
}

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_produce_one_winner() {
        for (name, registry, _dir) in registries().await {
            let id = registry
                .insert(TaskRecord::new(TaskKind::Request))
                .await
                .unwrap()
                .task_id;

            let attempts = (0..8).map(|n| {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.claim(&id, &format!("w{n}"), false).await })
            });
            let results = futures::future::join_all(attempts).await;

            let winners = results
                .into_iter()
                .map(|joined| joined.unwrap())
                .filter(|r| matches!(r, Ok(ClaimOutcome::Claimed(_))))
                .count();
            assert_eq!(winners, 1, "{name}");
            assert_eq!(registry.get(&id).await.unwrap().attempt, 1, "{name}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leftover_lock_file_still_yields_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let first = FsTaskRegistry::new(FsBackend::open(dir.path()).await.unwrap());
        let id = first
            .insert(TaskRecord::new(TaskKind::Request))
            .await
            .unwrap()
            .task_id;
        // Left behind by a writer that died while holding the key.
        std::fs::write(dir.path().join(format!("{id}.lock")), b"").unwrap();

        // Separate backends on one directory stand in for worker processes.
        let mut attempts = Vec::new();
        for n in 0..12 {
            let registry: Arc<dyn TaskRegistry> =
                Arc::new(FsTaskRegistry::new(FsBackend::open(dir.path()).await.unwrap()));
            let id = id.clone();
            attempts.push(tokio::spawn(async move {
                registry.claim(&id, &format!("w{n}"), false).await
            }));
        }
        let results = futures::future::join_all(attempts).await;

        let outcomes: Vec<ClaimOutcome> = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(first.get(&id).await.unwrap().attempt, 1);
    }
}

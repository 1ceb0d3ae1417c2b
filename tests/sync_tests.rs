//! Integration tests for sync planning and execution.

use mirrorsync::{
    ContentHash, CoreConfig, CoreError, FileType, HashSource, LocalMirror, LockManager,
    ManualClock, MemoryStore, MirrorSync, RemoteStore, Resource, SyncDirection, SystemClock,
};
use std::sync::Arc;

async fn remote() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .insert_set(
            "proj",
            vec![
                Resource::new("Code", FileType::Code, "function main() {}\n"),
                Resource::new("lib/util", FileType::Code, "const x = 1;\n"),
                Resource::new("index", FileType::Markup, "<html></html>\n"),
            ],
        )
        .await;
    store
}

fn service(dir: &tempfile::TempDir, store: &MemoryStore, clock: Arc<ManualClock>) -> MirrorSync {
    let config = CoreConfig {
        lock_dir: dir.path().join("locks"),
        plan_ttl_ms: 60_000,
        ..CoreConfig::default()
    };
    MirrorSync::with_clock(
        config,
        clock,
        Arc::new(store.clone()),
        LocalMirror::new(dir.path().join("mirror")),
    )
}

#[tokio::test]
async fn test_bootstrap_pull_then_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let svc = service(&dir, &store, Arc::new(ManualClock::default()));

    // A stray local file must survive a bootstrap.
    svc.mirror()
        .write("proj", "scratch", FileType::Code, "// mine\n")
        .await
        .unwrap();

    let plan = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    assert!(plan.is_bootstrap);
    assert_eq!(plan.operations.add.len(), 3);
    assert!(plan.operations.delete.is_empty());
    assert!(plan.deletion_token.is_none());
    assert_eq!(plan.metadata["remote_files"], 3);

    let result = svc.execute_sync(&plan.plan_id, None).await.unwrap();
    assert_eq!(result.added.len(), 3);
    assert_eq!(
        result.hashes["lib/util"],
        ContentHash::of_str("const x = 1;\n")
    );
    let local = svc
        .mirror()
        .read("proj", "lib/util", FileType::Code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.content, "const x = 1;\n");
    assert!(svc
        .mirror()
        .read("proj", "scratch", FileType::Code)
        .await
        .unwrap()
        .is_some());

    let state = svc.mirror().load_state("proj").await.unwrap().unwrap();
    assert_eq!(state.files.len(), 3);
    assert!(state.last_synced_at.is_some());

    // Once a state file exists the next plan is not a bootstrap and may
    // delete the stray file.
    let again = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    assert!(!again.is_bootstrap);
    assert!(again.operations.add.is_empty() && again.operations.update.is_empty());
    assert_eq!(again.operations.delete.len(), 1);
    assert!(again.deletion_token.is_some());
}

#[tokio::test]
async fn test_push_deletion_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let svc = service(&dir, &store, Arc::new(ManualClock::default()));

    let boot = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    svc.execute_sync(&boot.plan_id, None).await.unwrap();

    svc.mirror()
        .remove("proj", "index", FileType::Markup)
        .await
        .unwrap();
    svc.mirror()
        .write("proj", "Code", FileType::Code, "function main() { run(); }\n")
        .await
        .unwrap();

    let plan = svc.plan_sync(SyncDirection::Push, "proj").await.unwrap();
    assert_eq!(plan.operations.update.len(), 1);
    assert_eq!(plan.operations.delete.len(), 1);
    let token = plan.deletion_token.clone().unwrap();

    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidDeletionToken { .. }));
    let err = svc.execute_sync(&plan.plan_id, Some("deadbeef")).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidDeletionToken { .. }));

    // The plan survives bad tokens.
    let result = svc.execute_sync(&plan.plan_id, Some(&token)).await.unwrap();
    assert_eq!(result.deleted, vec!["index"]);
    assert_eq!(result.updated, vec!["Code"]);

    let files = store.read_all("proj").await.unwrap();
    let names: Vec<&str> = files.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Code", "lib/util"]);
    assert_eq!(files[0].content, "function main() { run(); }\n");

    // Executed plans are gone.
    let err = svc.execute_sync(&plan.plan_id, Some(&token)).await.unwrap_err();
    assert!(matches!(err, CoreError::PlanNotFound { .. }));
}

#[tokio::test]
async fn test_expired_plan_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let clock = Arc::new(ManualClock::default());
    let svc = service(&dir, &store, clock.clone());

    let plan = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    clock.advance(chrono::Duration::seconds(61));

    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    match err {
        CoreError::PlanExpired {
            plan_id,
            expired_at,
        } => {
            assert_eq!(plan_id, plan.plan_id);
            assert_eq!(expired_at, plan.expires_at);
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::PlanNotFound { .. }));
    assert!(svc.mirror().list("proj").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_drift_after_planning_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let svc = service(&dir, &store, Arc::new(ManualClock::default()));

    let plan = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    store
        .write("proj", "Code", "function main() { changed(); }\n", FileType::Code)
        .await
        .unwrap();

    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    match err {
        CoreError::Conflict(c) => {
            assert_eq!(c.file_name, "Code");
            assert_eq!(c.source, HashSource::Computed);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(svc.mirror().list("proj").await.unwrap().is_empty());
    assert!(svc.mirror().load_state("proj").await.unwrap().is_none());
    assert!(svc.lock_holder("proj").unwrap().is_none());
}

#[tokio::test]
async fn test_pull_overwrites_stale_mirror_copy() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let svc = service(&dir, &store, Arc::new(ManualClock::default()));

    let boot = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    svc.execute_sync(&boot.plan_id, None).await.unwrap();

    store
        .write("proj", "index", "<html><body/></html>\n", FileType::Markup)
        .await
        .unwrap();
    let plan = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();
    assert_eq!(plan.operations.update.len(), 1);
    assert_eq!(
        plan.operations.update[0].remote_hash,
        Some(ContentHash::of_str("<html><body/></html>\n"))
    );
    svc.execute_sync(&plan.plan_id, None).await.unwrap();

    let local = svc
        .mirror()
        .read("proj", "index", FileType::Markup)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.content, "<html><body/></html>\n");
    let state = svc.mirror().load_state("proj").await.unwrap().unwrap();
    assert_eq!(state.hash_of("index"), Some(&local.hash()));
}

#[tokio::test]
async fn test_plan_survives_lock_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let store = remote().await;
    let config = CoreConfig {
        lock_dir: dir.path().join("locks"),
        lock_wait_ms: 50,
        lock_poll_ms: 5,
        ..CoreConfig::default()
    };
    let svc = MirrorSync::new(
        config,
        Arc::new(store.clone()),
        LocalMirror::new(dir.path().join("mirror")),
    );
    let plan = svc.plan_sync(SyncDirection::Pull, "proj").await.unwrap();

    // Another process is busy with the same set.
    let other = LockManager::new(dir.path().join("locks"), Arc::new(SystemClock));
    let held = other.acquire("proj", "sync-push", None).await.unwrap();

    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(svc.mirror().list("proj").await.unwrap().is_empty());

    held.release().unwrap();
    let result = svc.execute_sync(&plan.plan_id, None).await.unwrap();
    assert_eq!(result.added.len(), 3);
    let err = svc.execute_sync(&plan.plan_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::PlanNotFound { .. }));
}

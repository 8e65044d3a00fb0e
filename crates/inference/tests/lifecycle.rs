mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{open_ended_dir, CountingLoader};
use inference::{LoadError, LoadState, ModelRegistry, UnloadOutcome};

async fn wait_for_state(registry: &ModelRegistry, state: LoadState) {
    let mut rx = registry.subscribe();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.state == state))
        .await
        .expect("state change timed out")
        .unwrap();
}

#[tokio::test]
async fn concurrent_loads_share_one_instance() {
    let dir = open_ended_dir(1);
    let loader = CountingLoader::new(dir.path());
    let calls = loader.calls.clone();
    let registry = ModelRegistry::new(loader);

    let (a, b) = tokio::join!(registry.ensure_loaded(), registry.ensure_loaded());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(a.model(), b.model()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let c = registry.ensure_loaded().await.unwrap();
    assert!(Arc::ptr_eq(a.model(), c.model()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.load_count(), 1);
    assert_eq!(registry.active_leases(), 3);

    let status = registry.status();
    assert_eq!(status.state, LoadState::Ready);
    assert_eq!(status.progress, 1.0);
}

#[tokio::test]
async fn unload_waits_for_outstanding_leases() {
    let dir = open_ended_dir(2);
    let registry = ModelRegistry::new(CountingLoader::new(dir.path()));

    let lease = registry.ensure_loaded().await.unwrap();
    assert_eq!(registry.unload(), UnloadOutcome::Deferred);
    assert_eq!(registry.status().state, LoadState::Ready);

    drop(lease);
    assert_eq!(registry.status().state, LoadState::Unloaded);
    assert_eq!(registry.active_leases(), 0);
    assert_eq!(registry.unload(), UnloadOutcome::Unloaded);
}

#[tokio::test]
async fn new_request_cancels_a_deferred_unload() {
    let dir = open_ended_dir(2);
    let registry = ModelRegistry::new(CountingLoader::new(dir.path()));

    let first = registry.ensure_loaded().await.unwrap();
    assert_eq!(registry.unload(), UnloadOutcome::Deferred);
    let second = registry.ensure_loaded().await.unwrap();
    drop(first);
    drop(second);
    assert_eq!(registry.status().state, LoadState::Ready);
    assert_eq!(registry.load_count(), 1);
}

#[tokio::test]
async fn unload_during_load_discards_the_result() {
    let dir = open_ended_dir(3);
    let (loader, release) = CountingLoader::gated(dir.path());
    let calls = loader.calls.clone();
    let registry = ModelRegistry::new(loader);

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.ensure_loaded().await.map(drop) })
    };
    wait_for_state(&registry, LoadState::Loading).await;
    assert_eq!(registry.unload(), UnloadOutcome::Deferred);

    release.send(()).unwrap();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(*err, LoadError::Unloaded));
    assert_eq!(registry.status().state, LoadState::Unloaded);

    release.send(()).unwrap();
    registry.ensure_loaded().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_load_reaches_every_waiter_and_resets() {
    let empty = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(CountingLoader::new(empty.path()));

    let (a, b) = tokio::join!(registry.ensure_loaded(), registry.ensure_loaded());
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(matches!(*a, LoadError::Io(_)));

    let health = registry.health();
    assert_eq!(health.state, LoadState::Unloaded);
    assert!(!health.ready);
    assert!(health.last_error.is_some());
    assert_eq!(registry.load_count(), 1);
}

#[tokio::test]
async fn repeated_failures_mark_the_model_unhealthy_until_reload() {
    let dir = open_ended_dir(4);
    let loader = CountingLoader::new(dir.path());
    let registry = ModelRegistry::with_threshold(Arc::new(loader), 2);

    let lease = registry.ensure_loaded().await.unwrap();
    lease.record_session(false);
    lease.record_session(true);
    lease.record_session(false);
    assert!(registry.health().ready);
    assert_eq!(registry.health().consecutive_failures, 1);

    lease.record_session(false);
    let health = registry.health();
    assert!(health.unhealthy);
    assert!(!health.ready);
    let err = registry.ensure_loaded().await.unwrap_err();
    assert!(matches!(*err, LoadError::Unhealthy { failures: 2 }));

    // The old model stays the only resident one until its session lets go.
    let old = Arc::downgrade(lease.model());
    let reload = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.reload().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reload.is_finished());
    assert_eq!(registry.active_leases(), 1);
    assert_eq!(registry.load_count(), 1);
    assert!(matches!(
        *registry.ensure_loaded().await.unwrap_err(),
        LoadError::Unhealthy { .. }
    ));

    drop(lease);
    let fresh = tokio::time::timeout(Duration::from_secs(30), reload)
        .await
        .expect("reload timed out")
        .unwrap()
        .unwrap();
    assert!(old.upgrade().is_none());
    let health = registry.health();
    assert!(health.ready);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(registry.load_count(), 2);
    assert_eq!(registry.active_leases(), 1);

    drop(fresh);
    assert_eq!(registry.active_leases(), 0);
}

#[tokio::test]
async fn reload_without_sessions_replaces_the_model_at_once() {
    let dir = open_ended_dir(6);
    let registry = ModelRegistry::new(CountingLoader::new(dir.path()));

    let first = registry.ensure_loaded().await.unwrap();
    let old = Arc::downgrade(first.model());
    drop(first);

    let fresh = registry.reload().await.unwrap();
    assert!(old.upgrade().is_none());
    assert_eq!(registry.load_count(), 2);
    assert_eq!(registry.status().state, LoadState::Ready);
    drop(fresh);
}

#[tokio::test]
async fn failed_load_after_unload_request_reports_the_failure() {
    let empty = tempfile::tempdir().unwrap();
    let (loader, release) = CountingLoader::gated(empty.path());
    let registry = ModelRegistry::new(loader);

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.ensure_loaded().await.map(drop) })
    };
    wait_for_state(&registry, LoadState::Loading).await;
    assert_eq!(registry.unload(), UnloadOutcome::Deferred);

    release.send(()).unwrap();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(*err, LoadError::Io(_)), "got {err:?}");
    let health = registry.health();
    assert_eq!(health.state, LoadState::Unloaded);
    assert!(health.last_error.is_some());
}

#[tokio::test]
async fn warm_up_runs_as_part_of_loading() {
    let dir = open_ended_dir(5);
    let registry = ModelRegistry::new(inference::DirectoryLoader::new(dir.path()));
    registry.ensure_loaded().await.unwrap();
    let health = registry.health();
    assert!(health.ready);
    assert_eq!(health.progress, 1.0);
}

//! Coordinator behavior with several instances sharing one backend.

mod support;

use std::sync::Arc;
use std::time::Duration;

use cachelink_core::{
    CacheEngine, CacheSettings, ClearCoordinator, CoordinatorSettings, SetRequest,
    START_CLEAR_MESSAGE,
};
use cachelink_storage::{LocalStore, StorageAdapter, Transport};
use serde_json::json;
use support::FaultyStore;

const INTERVAL: Duration = Duration::from_secs(1);

/// One cachelink instance attached to the shared backend.
fn instance(store: &Arc<LocalStore>) -> ClearCoordinator {
    instance_on(store.clone())
}

fn instance_on(transport: Arc<dyn Transport>) -> ClearCoordinator {
    let storage = Arc::new(StorageAdapter::new(transport).unwrap());
    let engine = Arc::new(CacheEngine::new(storage, CacheSettings::default()));
    ClearCoordinator::new(
        engine,
        CoordinatorSettings {
            interval: INTERVAL,
            ..CoordinatorSettings::default()
        },
    )
}

async fn set(c: &ClearCoordinator, key: &str) {
    c.engine()
        .set(&SetRequest {
            key: key.to_string(),
            data: Some(json!(key)),
            millis: 100_000,
            associations: Vec::new(),
        })
        .await
        .unwrap();
}

async fn is_cleared(c: &ClearCoordinator, key: &str) -> bool {
    c.engine().get(key).await.unwrap().is_none()
}

/// Polls until `check` passes; time is paused, so each sleep auto-advances.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_leader_migrates_queue_and_drains() {
    let store = Arc::new(LocalStore::new());
    let (a, b) = (instance(&store), instance(&store));
    let (a, b) = (&a, &b);
    a.listen_for_messages().await.unwrap();
    b.listen_for_messages().await.unwrap();

    set(a, "x").await;
    set(a, "y").await;
    a.engine()
        .clear_later(&["x".to_string(), "y".to_string()])
        .await
        .unwrap();

    assert!(a.check_sync_key().await.unwrap());
    assert!(!b.check_sync_key().await.unwrap());
    assert_eq!(a.engine().clear_later_count().await.unwrap(), 0);

    eventually(move || async move {
        is_cleared(a, "x").await
            && is_cleared(a, "y").await
            && !a.is_draining()
            && !b.is_draining()
    })
    .await;
    assert_eq!(a.engine().clear_now_count().await.unwrap(), 0);

    a.shutdown();
    b.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_start_clear_now_process_reports_moved_keys() {
    let store = Arc::new(LocalStore::new());
    let a = &instance(&store);

    assert_eq!(a.start_clear_now_process().await.unwrap(), 0);
    assert!(!a.is_draining());

    set(a, "x").await;
    a.engine().clear_later(&["x".to_string()]).await.unwrap();
    assert_eq!(a.start_clear_now_process().await.unwrap(), 1);

    eventually(move || async move { is_cleared(a, "x").await && !a.is_draining() }).await;
}

#[tokio::test(start_paused = true)]
async fn test_published_trigger_starts_drain() {
    let store = Arc::new(LocalStore::new());
    let (a, b) = (instance(&store), instance(&store));
    let (a, b) = (&a, &b);
    a.listen_for_messages().await.unwrap();
    // Listening twice keeps a single subscription.
    a.listen_for_messages().await.unwrap();

    set(a, "x").await;
    a.engine()
        .storage()
        .sadd(a.engine().clear_now_key(), &["x".to_string()])
        .await
        .unwrap();

    b.engine()
        .storage()
        .publish(&b.settings().channel, "somethingElse")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!is_cleared(a, "x").await);

    b.engine()
        .storage()
        .publish(&b.settings().channel, START_CLEAR_MESSAGE)
        .await
        .unwrap();
    eventually(move || async move { is_cleared(a, "x").await }).await;

    a.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_cron_tick_clears_queued_keys() {
    let store = Arc::new(LocalStore::new());
    let a = &instance(&store);
    set(a, "x").await;
    a.engine().clear_later(&["x".to_string()]).await.unwrap();

    a.start_cron();
    tokio::time::sleep(INTERVAL / 2).await;
    assert!(!is_cleared(a, "x").await);

    eventually(move || async move { is_cleared(a, "x").await }).await;
    assert_eq!(a.engine().clear_later_count().await.unwrap(), 0);

    // The lease is held for the rest of this interval.
    assert!(!a.check_sync_key().await.unwrap());
    a.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_cron_does_not_tick() {
    let store = Arc::new(LocalStore::new());
    let a = &instance(&store);
    set(a, "x").await;
    a.engine().clear_later(&["x".to_string()]).await.unwrap();

    a.start_cron();
    a.stop_cron();
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(!is_cleared(a, "x").await);
    assert_eq!(a.engine().clear_later_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_moved_keys_drain_when_publish_fails() {
    let store = FaultyStore::new();
    let a = &instance_on(store.clone());
    set(a, "x").await;
    a.engine().clear_later(&["x".to_string()]).await.unwrap();

    store.fail("PUBLISH");
    assert_eq!(a.start_clear_now_process().await.unwrap(), 1);

    eventually(move || async move { is_cleared(a, "x").await && !a.is_draining() }).await;
    assert_eq!(a.engine().clear_later_count().await.unwrap(), 0);
    assert_eq!(a.engine().clear_now_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_drain_allows_a_new_one() {
    let store = FaultyStore::new();
    let a = &instance_on(store.clone());
    set(a, "x").await;
    a.engine()
        .storage()
        .sadd(a.engine().clear_now_key(), &["x".to_string()])
        .await
        .unwrap();

    store.fail("SPOP");
    assert!(a.clear_now().await.is_err());
    assert!(!a.is_draining());
    assert!(!is_cleared(a, "x").await);

    store.heal("SPOP");
    let batches = a.clear_now().await.unwrap();
    assert_eq!(*batches, vec![vec!["x".to_string()]]);
    assert!(is_cleared(a, "x").await);
}

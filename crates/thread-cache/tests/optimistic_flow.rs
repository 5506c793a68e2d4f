use std::sync::Arc;
use std::time::Duration;

use thread_cache::store::{MemoryStore, StoreHandles};
use thread_cache::{
    Anchor, BackendError, CacheConfig, CacheError, InMemoryBackend, LocalBus, LogEntry, LogStore,
    ManualClock, MessageDraft, Role, SyncEngine,
};

struct Harness {
    store: Arc<MemoryStore>,
    backend: Arc<InMemoryBackend>,
    engine: SyncEngine,
}

async fn harness(existing: usize) -> Harness {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(clock.clone())));
    let engine = SyncEngine::new(
        CacheConfig::default(),
        StoreHandles::memory(store.clone(), Arc::new(LocalBus::new())),
        backend.clone(),
        Arc::new(clock),
    );
    let history: Vec<LogEntry> = (0..existing)
        .map(|i| LogEntry::new(format!("m{i}"), "t1", Role::User, "earlier", 1_000 + i as i64))
        .collect();
    store.upsert_all("t1", &history).await.unwrap();
    engine.get_viewport("t1", Anchor::Bottom).await;
    Harness {
        store,
        backend,
        engine,
    }
}

#[test_timeout::tokio_timeout_test]
async fn confirmed_message_keeps_its_position() {
    let h = harness(3).await;
    let (temp, handle) = h
        .engine
        .send_message(MessageDraft::new("t1", Role::User, "hi there"))
        .await;
    assert!(temp.is_optimistic);
    assert!(temp.id.starts_with("temp-"));
    let window = h.engine.viewport().cached("t1").unwrap();
    assert_eq!(window.position(&temp.id), Some(3));

    let confirmed = handle.await.unwrap().unwrap();
    assert_eq!(confirmed.id, "msg-1");
    assert!(!confirmed.is_optimistic);

    let window = h.engine.viewport().cached("t1").unwrap();
    assert_eq!(window.len(), 4);
    assert!(window.get(&temp.id).is_none());
    assert_eq!(window.position("msg-1"), Some(3));
    assert!(!window.entries[3].is_optimistic);
    assert!(!h.engine.optimistic().is_speculative(&temp.id));
    assert_eq!(h.store.count("t1").await.unwrap(), 4);
    assert!(h.engine.pending().snapshot().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn rejected_message_is_rolled_back() {
    let h = harness(2).await;
    h.backend
        .fail_next(BackendError::Rejected("content policy".into()), 1);
    let (temp, handle) = h
        .engine
        .send_message(MessageDraft::new("t1", Role::User, "nope"))
        .await;

    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(CacheError::Backend(BackendError::Rejected(_)))
    ));
    assert_eq!(h.backend.calls(), 1);

    let window = h.engine.viewport().cached("t1").unwrap();
    assert_eq!(window.len(), 2);
    assert!(window.get(&temp.id).is_none());
    assert!(!h.engine.optimistic().is_speculative(&temp.id));
    assert_eq!(h.store.count("t1").await.unwrap(), 2);

    let failed = h.engine.pending().take_failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn rate_limited_message_is_retried_with_backoff() {
    let h = harness(1).await;
    h.backend.fail_next(BackendError::RateLimited, 2);
    let started = tokio::time::Instant::now();
    let (temp, handle) = h
        .engine
        .send_message(MessageDraft::new("t1", Role::User, "eventually"))
        .await;

    let confirmed = handle.await.unwrap().unwrap();
    assert_eq!(h.backend.calls(), 3);
    // 250ms then 500ms with the default policy.
    assert!(started.elapsed() >= Duration::from_millis(750));

    let window = h.engine.viewport().cached("t1").unwrap();
    assert!(window.get(&temp.id).is_none());
    assert_eq!(window.position(&confirmed.id), Some(1));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn exhausted_retries_roll_back() {
    let h = harness(1).await;
    h.backend
        .fail_next(BackendError::Unavailable("connection reset".into()), 5);
    let (temp, handle) = h
        .engine
        .send_message(MessageDraft::new("t1", Role::User, "lost"))
        .await;

    match handle.await.unwrap() {
        Err(CacheError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert!(h
        .engine
        .viewport()
        .cached("t1")
        .unwrap()
        .get(&temp.id)
        .is_none());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn store_write_failures_are_retried() {
    let h = harness(1).await;
    let temp = h
        .engine
        .add_optimistic(LogEntry::new("temp-a", "t1", Role::User, "draft", 5_000))
        .await;
    h.store.fail_next_writes(2);

    let confirmed = h
        .engine
        .replace_optimistic(&temp.id, LogEntry::new("srv-1", "t1", Role::User, "draft", 5_000))
        .await
        .unwrap();
    assert_eq!(confirmed.id, "srv-1");
    assert_eq!(h.store.count("t1").await.unwrap(), 2);
    assert!(h.engine.pending().snapshot().is_empty());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unwritable_store_still_shows_confirmation() {
    let h = harness(1).await;
    let temp = h
        .engine
        .add_optimistic(LogEntry::new("temp-b", "t1", Role::User, "draft", 5_000))
        .await;
    h.store.fail_next_writes(10);

    let result = h
        .engine
        .replace_optimistic(&temp.id, LogEntry::new("srv-2", "t1", Role::User, "draft", 5_000))
        .await;
    assert!(matches!(result, Err(CacheError::RetriesExhausted { .. })));

    let window = h.engine.viewport().cached("t1").unwrap();
    assert_eq!(window.position("srv-2"), Some(1));
    assert!(window.get("temp-b").is_none());
    assert_eq!(h.engine.pending().take_failed().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn rollback_of_unknown_id_is_a_no_op() {
    let h = harness(2).await;
    assert!(!h.engine.rollback("temp-missing").await);
    assert_eq!(h.engine.viewport().cached("t1").unwrap().len(), 2);
}

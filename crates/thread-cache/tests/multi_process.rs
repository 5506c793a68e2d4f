//! Several engines sharing one store and one bus behave like separate processes.

use std::sync::Arc;
use std::time::Duration;

use thread_cache::store::{MemoryStore, StoreHandles};
use thread_cache::{
    Anchor, CacheConfig, InMemoryBackend, LocalBus, LogEntry, LogStore, ManualClock, Role,
    SeedOutcome, SyncEngine,
};

struct Cluster {
    clock: ManualClock,
    store: Arc<MemoryStore>,
    backend: Arc<InMemoryBackend>,
    a: SyncEngine,
    b: SyncEngine,
}

fn cluster() -> Cluster {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let bus = Arc::new(LocalBus::new());
    let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(clock.clone())));
    let engine = |process_id: &str| {
        let config = CacheConfig {
            process_id: process_id.to_string(),
            ..CacheConfig::default()
        };
        SyncEngine::new(
            config,
            StoreHandles::memory(store.clone(), bus.clone()),
            backend.clone(),
            Arc::new(clock.clone()),
        )
    };
    let a = engine("proc-a");
    let b = engine("proc-b");
    Cluster {
        clock,
        store,
        backend,
        a,
        b,
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[test_timeout::tokio_timeout_test]
async fn lock_is_exclusive_across_processes() {
    let c = cluster();
    assert!(c.a.acquire("R", Some(Duration::from_millis(5_000))).await);
    assert!(!c.b.acquire("R", None).await);
    assert!(c.a.release("R").await);
    assert!(c.b.acquire("R", None).await);
    // A's stale release must not evict B.
    assert!(!c.a.release("R").await);
    assert_eq!(c.a.locks().holder("R").await.as_deref(), Some("proc-b"));
}

#[test_timeout::tokio_timeout_test]
async fn expired_lock_passes_to_next_owner() {
    let c = cluster();
    assert!(c.a.acquire("R", Some(Duration::from_millis(1_000))).await);
    c.clock.advance_ms(1_500);
    assert!(c.b.acquire("R", None).await);
    assert!(!c.a.release("R").await);
    assert!(c.b.release("R").await);
}

#[test_timeout::tokio_timeout_test]
async fn presence_is_shared() {
    let c = cluster();
    c.a.heartbeat("t1", "alice").await.unwrap();
    c.b.heartbeat("t1", "bob").await.unwrap();
    assert_eq!(c.a.active_members("t1").await, vec!["alice", "bob"]);

    c.clock.advance_ms(20_000);
    c.b.heartbeat("t1", "bob").await.unwrap();
    c.clock.advance_ms(15_000);
    assert_eq!(c.b.active_members("t1").await, vec!["bob"]);

    c.b.leave("t1", "bob").await.unwrap();
    assert!(c.a.active_members("t1").await.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn confirmed_entries_reach_other_windows() {
    let c = cluster();
    c.backend.insert_messages(
        "t1",
        vec![LogEntry::new("m0", "t1", Role::User, "hello", 1_000)],
    );
    assert_eq!(
        c.a.seed_thread("t1", false).await.unwrap(),
        SeedOutcome::Seeded { entries: 1 }
    );
    c.b.get_viewport("t1", Anchor::Bottom).await;
    let _watch = c.b.watch_thread("t1").await.unwrap();
    let _mirror = c.b.watch_optimistic().await.unwrap();

    let temp = c
        .a
        .add_optimistic(LogEntry::new("temp-1", "t1", Role::User, "draft", 2_000))
        .await;
    assert!(
        eventually(|| c
            .b
            .viewport()
            .cached("t1")
            .is_some_and(|w| w.get("temp-1").is_some_and(|e| e.is_optimistic)))
        .await
    );

    c.a
        .replace_optimistic(&temp.id, LogEntry::new("m1", "t1", Role::User, "draft", 2_000))
        .await
        .unwrap();
    assert!(
        eventually(|| c.b.viewport().cached("t1").is_some_and(|w| {
            w.get("temp-1").is_none() && w.get("m1").is_some_and(|e| !e.is_optimistic)
        }))
        .await
    );
    let window = c.b.viewport().cached("t1").unwrap();
    assert_eq!(window.len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn remote_resync_invalidates_window() {
    let c = cluster();
    c.backend.insert_messages(
        "t1",
        (0..5)
            .map(|i| LogEntry::new(format!("m{i}"), "t1", Role::User, "x", i))
            .collect(),
    );
    c.a.seed_thread("t1", false).await.unwrap();
    assert_eq!(c.b.get_viewport("t1", Anchor::Bottom).await.len(), 5);
    let _sync = c.b.watch_sync().await.unwrap();

    c.backend.insert_messages(
        "t1",
        vec![LogEntry::new("m5", "t1", Role::Assistant, "late", 5)],
    );
    c.a.seed_thread("t1", true).await.unwrap();
    assert!(eventually(|| c.b.viewport().cached("t1").is_none()).await);
    assert_eq!(c.b.get_viewport("t1", Anchor::Bottom).await.len(), 6);
}

#[test_timeout::tokio_timeout_test]
async fn only_one_process_resyncs_at_a_time() {
    let c = cluster();
    assert!(
        c.b.acquire(&thread_cache::keys::resync_resource("t1"), None)
            .await
    );
    assert_eq!(
        c.a.seed_thread("t1", true).await.unwrap(),
        SeedOutcome::Contended
    );
    assert_eq!(c.store.count("t1").await.unwrap(), 0);
}

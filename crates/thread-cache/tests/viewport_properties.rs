use std::collections::HashSet;
use std::sync::Arc;

use thread_cache::config::ViewportLimits;
use thread_cache::store::{LogStore, MemoryStore, ScanOrder, ScoreRange};
use thread_cache::viewport::ViewportCache;
use thread_cache::{Anchor, Direction, LogEntry, Role};

fn synced(thread: &str, n: usize) -> Vec<LogEntry> {
    (0..n)
        .map(|i| {
            LogEntry::new(
                format!("msg_{i}"),
                thread,
                if i % 3 == 0 { Role::User } else { Role::Assistant },
                format!("body {i}"),
                1_700_000_000_000 + i as i64 * 10,
            )
        })
        .collect()
}

async fn cache_with(thread: &str, n: usize) -> (Arc<MemoryStore>, ViewportCache) {
    let store = Arc::new(MemoryStore::new());
    if n > 0 {
        store.upsert_all(thread, &synced(thread, n)).await.unwrap();
    }
    let cache = ViewportCache::new(store.clone(), ViewportLimits::default());
    (store, cache)
}

fn ids(entries: &[LogEntry]) -> Vec<String> {
    entries.iter().map(|entry| entry.id.clone()).collect()
}

#[test_timeout::tokio_timeout_test]
async fn bottom_viewport_holds_min_of_n_and_fifty() {
    for n in [1usize, 49, 50, 51, 120] {
        let (_store, cache) = cache_with("t", n).await;
        let window = cache.get_viewport("t", Anchor::Bottom).await;
        assert_eq!(window.len(), n.min(50), "n = {n}");
        assert!(window
            .entries
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert_eq!(window.has_more.top, n > 50, "n = {n}");
        assert!(!window.has_more.bottom);
        assert_eq!(window.end_cursor, Some(format!("msg_{}", n - 1)));
    }
}

#[test_timeout::tokio_timeout_test]
async fn empty_thread_has_no_cursors() {
    let (_store, cache) = cache_with("t", 0).await;
    let window = cache.get_viewport("t", Anchor::Bottom).await;
    assert!(window.entries.is_empty());
    assert!(!window.has_more.top);
    assert!(!window.has_more.bottom);
    assert!(window.start_cursor.is_none());
    assert!(window.end_cursor.is_none());
}

#[test_timeout::tokio_timeout_test]
async fn synced_thread_shows_last_fifty() {
    let (_store, cache) = cache_with("t", 1_500).await;
    let window = cache.get_viewport("t", Anchor::Bottom).await;
    let expected: Vec<String> = (1_450..1_500).map(|i| format!("msg_{i}")).collect();
    assert_eq!(ids(&window.entries), expected);
}

#[test_timeout::tokio_timeout_test]
async fn resync_replaces_previous_log() {
    let (store, cache) = cache_with("t", 80).await;
    let fresh: Vec<LogEntry> = synced("t", 10)
        .into_iter()
        .map(|entry| entry.with_version(2))
        .collect();
    store.upsert_all("t", &fresh).await.unwrap();
    assert_eq!(store.count("t").await.unwrap(), 10);
    let window = cache.get_viewport("t", Anchor::Top).await;
    assert_eq!(window.len(), 10);
    assert!(window.entries.iter().all(|entry| entry.version == 2));
}

#[test_timeout::tokio_timeout_test]
async fn paging_up_stays_bounded_and_unique() {
    let (_store, cache) = cache_with("t", 400).await;
    let window = cache.get_viewport("t", Anchor::Bottom).await;
    let mut cursor = window.start_cursor.unwrap();
    for _ in 0..8 {
        let fetched = cache.load_more("t", Direction::Up, &cursor).await;
        let Some(first) = fetched.first() else { break };
        cursor = first.id.clone();

        let window = cache.cached("t").unwrap();
        assert!(window.len() <= 100);
        let unique: HashSet<&str> = window.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(unique.len(), window.len());
        assert!(window
            .entries
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }
    let window = cache.cached("t").unwrap();
    assert_eq!(window.start_cursor.as_deref(), Some("msg_150"));
    assert!(window.has_more.bottom);
}

#[test_timeout::tokio_timeout_test]
async fn paging_down_from_top() {
    let (_store, cache) = cache_with("t", 90).await;
    let window = cache.get_viewport("t", Anchor::Top).await;
    let fetched = cache
        .load_more("t", Direction::Down, window.end_cursor.as_deref().unwrap())
        .await;
    assert_eq!(fetched.len(), 25);
    assert_eq!(fetched[0].id, "msg_50");
    let window = cache.cached("t").unwrap();
    assert_eq!(window.len(), 75);
    assert!(window.has_more.bottom);

    let fetched = cache
        .load_more("t", Direction::Down, window.end_cursor.as_deref().unwrap())
        .await;
    assert_eq!(fetched.len(), 15);
    let window = cache.cached("t").unwrap();
    assert_eq!(window.len(), 90);
    assert!(!window.has_more.bottom);
}

#[test_timeout::tokio_timeout_test]
async fn corrupted_members_are_filtered() {
    let (store, _cache) = cache_with("t", 20).await;
    store.insert_raw("t", 1_700_000_000_005, "{not json");
    store.insert_raw(
        "t",
        1_700_000_000_015,
        r#"{"id":"bad","thread_id":"t","content":"x","role":"user","timestamp":"yesterday"}"#,
    );
    store.insert_raw("t", 1_700_000_000_025, r#"{"id":"nope"}"#);

    let all = store.range_by_rank("t", 0, -1).await.unwrap();
    assert_eq!(all.len(), 20);
    let scored = store
        .range_by_score("t", ScoreRange::all(), 100, ScanOrder::Ascending)
        .await
        .unwrap();
    assert_eq!(ids(&scored), ids(&synced("t", 20)));
}

#[test_timeout::tokio_timeout_test]
async fn eleventh_thread_evicts_least_recent() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..11 {
        let thread = format!("t{i}");
        store.upsert_all(&thread, &synced(&thread, 3)).await.unwrap();
    }
    let cache = ViewportCache::new(store.clone(), ViewportLimits::default());
    for i in 0..10 {
        cache.get_viewport(&format!("t{i}"), Anchor::Bottom).await;
    }
    // Touch t0 so t1 is the least recently used.
    cache.get_viewport("t0", Anchor::Bottom).await;
    cache.get_viewport("t10", Anchor::Bottom).await;

    let resident = cache.cached_threads();
    assert_eq!(resident.len(), 10);
    assert!(resident.contains(&"t0".to_string()));
    assert!(!resident.contains(&"t1".to_string()));
}

#[test_timeout::tokio_timeout_test]
async fn offline_store_degrades_without_errors() {
    let (store, cache) = cache_with("t", 60).await;
    let window = cache.get_viewport("t", Anchor::Bottom).await;
    store.set_offline(true);
    let cursor = window.start_cursor.unwrap();
    assert!(cache.load_more("t", Direction::Up, &cursor).await.is_empty());
    let expanded = cache.expand_viewport("t", 0, Direction::Down).await;
    assert_eq!(expanded.len(), 50, "last known good window is served");
    assert!(cache
        .get_viewport("other", Anchor::Bottom)
        .await
        .is_empty());
}

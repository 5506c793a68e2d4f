//! Store seams consumed by the cache services.
//!
//! [`LogStore`] is the ordered per-thread log, [`KvStore`] carries lock records and cached thread
//! metadata, [`PresenceStore`] the per-thread presence sets. Both backends ([`MemoryStore`] and
//! [`RedisStore`]) implement all three with the same semantics.

use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::clock::system_clock;
use crate::config::{redact_url, CacheConfig, StoreBackend};
use crate::error::StoreResult;
use crate::model::LogEntry;
use crate::notifier::{Bus, LocalBus, RedisBus};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Inclusive/exclusive bounds over timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRange {
    pub min: Bound<i64>,
    pub max: Bound<i64>,
}

impl ScoreRange {
    pub fn all() -> Self {
        Self {
            min: Bound::Unbounded,
            max: Bound::Unbounded,
        }
    }

    pub fn before(score: i64) -> Self {
        Self {
            min: Bound::Unbounded,
            max: Bound::Excluded(score),
        }
    }

    pub fn after(score: i64) -> Self {
        Self {
            min: Bound::Excluded(score),
            max: Bound::Unbounded,
        }
    }

    /// Strictly between `low` and `high`.
    pub fn between(low: i64, high: i64) -> Self {
        Self {
            min: Bound::Excluded(low),
            max: Bound::Excluded(high),
        }
    }

    pub fn contains(&self, score: i64) -> bool {
        let above = match self.min {
            Bound::Included(min) => score >= min,
            Bound::Excluded(min) => score > min,
            Bound::Unbounded => true,
        };
        let below = match self.max {
            Bound::Included(max) => score <= max,
            Bound::Excluded(max) => score < max,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// `ZRANGEBYSCORE`-style argument for the lower bound.
    pub fn min_arg(&self) -> String {
        bound_arg(self.min, "-inf")
    }

    pub fn max_arg(&self) -> String {
        bound_arg(self.max, "+inf")
    }
}

fn bound_arg(bound: Bound<i64>, unbounded: &str) -> String {
    match bound {
        Bound::Included(score) => score.to_string(),
        Bound::Excluded(score) => format!("({score}"),
        Bound::Unbounded => unbounded.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Resolve a Redis-style rank range (negative ranks count from the tail, `stop` inclusive) against
/// a collection of `len` members.
pub fn resolve_rank_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Remote ordered collection keyed by thread, sorted by entry timestamp.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Entries by rank, Redis semantics (`-1` is the newest entry, `stop` inclusive).
    async fn range_by_rank(
        &self,
        thread_id: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<LogEntry>>;

    /// Up to `limit` entries within `range`. Descending scans return newest first.
    async fn range_by_score(
        &self,
        thread_id: &str,
        range: ScoreRange,
        limit: usize,
        order: ScanOrder,
    ) -> StoreResult<Vec<LogEntry>>;

    async fn count(&self, thread_id: &str) -> StoreResult<u64>;

    async fn count_in_range(&self, thread_id: &str, range: ScoreRange) -> StoreResult<u64>;

    /// Replace the whole log atomically; either every entry lands or the previous log survives.
    async fn upsert_all(&self, thread_id: &str, entries: &[LogEntry]) -> StoreResult<()>;

    /// Insert or replace one entry by id under the conflict policy. Returns whether it was applied.
    async fn insert(&self, entry: &LogEntry) -> StoreResult<bool>;

    async fn remove(&self, thread_id: &str, entry_id: &str) -> StoreResult<bool>;

    /// Point lookup of an entry's score.
    async fn score_of(&self, thread_id: &str, entry_id: &str) -> StoreResult<Option<i64>>;
}

/// String records with expiry: lock rows and cached thread metadata.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create `key` only if absent. Returns whether this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only while it still holds `expected`, atomically.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;
}

/// Per-thread member sets scored by last-seen time.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record `member` as seen at `now_ms`, drop members last seen before `stale_before_ms`, and
    /// refresh the set's expiry.
    async fn touch(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        stale_before_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Members last seen at or after `since_ms`.
    async fn members_since(&self, key: &str, since_ms: u64) -> StoreResult<Vec<String>>;

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()>;
}

/// Store and bus handles shared by every service of one engine.
#[derive(Clone)]
pub struct StoreHandles {
    pub log: Arc<dyn LogStore>,
    pub kv: Arc<dyn KvStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub bus: Arc<dyn Bus>,
}

impl StoreHandles {
    pub fn memory(store: Arc<MemoryStore>, bus: Arc<LocalBus>) -> Self {
        Self {
            log: store.clone(),
            kv: store.clone(),
            presence: store,
            bus,
        }
    }

    pub fn redis(store: Arc<RedisStore>, bus: Arc<RedisBus>) -> Self {
        Self {
            log: store.clone(),
            kv: store.clone(),
            presence: store,
            bus,
        }
    }
}

/// Pick the configured backend, falling back to in-memory stores when Redis cannot be reached.
pub async fn build_stores(cfg: &CacheConfig) -> StoreHandles {
    match cfg.backend {
        StoreBackend::InMemory => {}
        StoreBackend::Redis => {
            if let Some(url) = cfg.redis_url.as_deref() {
                let connected = async {
                    let store = RedisStore::connect(url, cfg.messages_ttl_secs).await?;
                    let bus = RedisBus::connect(url).await?;
                    Ok::<_, crate::error::StoreError>((store, bus))
                }
                .await;
                match connected {
                    Ok((store, bus)) => {
                        return StoreHandles::redis(Arc::new(store), Arc::new(bus));
                    }
                    Err(err) => warn!(
                        redis = %redact_url(url),
                        error = %err,
                        "failed to init redis stores; falling back to memory"
                    ),
                }
            } else {
                warn!("THREAD_CACHE_BACKEND=redis but REDIS_URL missing; falling back to in-memory");
            }
        }
    }
    StoreHandles::memory(
        Arc::new(MemoryStore::with_clock(system_clock())),
        Arc::new(LocalBus::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn rank_ranges_follow_redis_semantics() {
        assert_eq!(resolve_rank_range(10, 0, 4), Some((0, 4)));
        assert_eq!(resolve_rank_range(10, -3, -1), Some((7, 9)));
        assert_eq!(resolve_rank_range(3, -50, -1), Some((0, 2)));
        assert_eq!(resolve_rank_range(3, 0, 49), Some((0, 2)));
        assert_eq!(resolve_rank_range(3, 5, 10), None);
        assert_eq!(resolve_rank_range(0, 0, -1), None);
    }

    #[test_timeout::timeout]
    fn score_range_args_and_membership() {
        let before = ScoreRange::before(100);
        assert_eq!(before.min_arg(), "-inf");
        assert_eq!(before.max_arg(), "(100");
        assert!(before.contains(99));
        assert!(!before.contains(100));

        let after = ScoreRange::after(100);
        assert!(after.contains(101));
        assert!(!after.contains(100));
        assert!(ScoreRange::all().contains(i64::MIN));

        let gap = ScoreRange::between(10, 20);
        assert_eq!((gap.min_arg(), gap.max_arg()), ("(10".to_string(), "(20".to_string()));
        assert!(gap.contains(11) && gap.contains(19));
        assert!(!gap.contains(10) && !gap.contains(20));
    }
}

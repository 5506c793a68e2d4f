use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{system_clock, ClockHandle};
use crate::codec::{decode_entries, decode_entry, encode_entry};
use crate::error::{StoreError, StoreResult};
use crate::model::{dedupe_by_id, LogEntry};
use crate::store::{
    resolve_rank_range, KvStore, LogStore, PresenceStore, ScanOrder, ScoreRange,
};

/// In-process store with the same semantics as the Redis backend. Several engines sharing one
/// instance behave like several processes sharing one Redis.
pub struct MemoryStore {
    clock: ClockHandle,
    inner: Mutex<Inner>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, ThreadLog>,
    kv: HashMap<String, KvRecord>,
    presence: HashMap<String, PresenceSet>,
}

/// Sorted members plus the id → member index, mirroring the two Redis keys.
#[derive(Default, Clone)]
struct ThreadLog {
    members: BTreeSet<(i64, String)>,
    index: HashMap<String, (i64, String)>,
}

impl ThreadLog {
    fn add(&mut self, entry: &LogEntry, member: String) {
        self.members.insert((entry.timestamp, member.clone()));
        self.index.insert(entry.id.clone(), (entry.timestamp, member));
    }

    fn remove_id(&mut self, entry_id: &str) -> bool {
        match self.index.remove(entry_id) {
            Some(key) => self.members.remove(&key),
            None => false,
        }
    }
}

struct KvRecord {
    value: String,
    expires_at_ms: u64,
}

#[derive(Default)]
struct PresenceSet {
    members: HashMap<String, u64>,
    expires_at_ms: u64,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    failing_writes: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: ClockHandle) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Every call fails with [`StoreError::Unavailable`] while offline.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Fail the next `count` write calls.
    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().failing_writes = count;
    }

    /// Place a raw member into a thread's log, bypassing encoding. Lets tests plant corrupted
    /// payloads the way a misbehaving writer would.
    pub fn insert_raw(&self, thread_id: &str, score: i64, raw: impl Into<String>) {
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(thread_id.to_string()).or_default();
        let raw = raw.into();
        if let Ok(entry) = decode_entry(&raw) {
            log.remove_id(&entry.id);
            log.index.insert(entry.id, (score, raw.clone()));
        }
        log.members.insert((score, raw));
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.faults.lock().offline {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn raw_members<F>(&self, thread_id: &str, select: F) -> Vec<String>
    where
        F: FnOnce(&BTreeSet<(i64, String)>) -> Vec<String>,
    {
        let inner = self.inner.lock();
        inner
            .logs
            .get(thread_id)
            .map(|log| select(&log.members))
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn range_by_rank(
        &self,
        thread_id: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<LogEntry>> {
        self.check_read()?;
        let raws = self.raw_members(thread_id, |members| {
            match resolve_rank_range(members.len(), start, stop) {
                Some((from, to)) => members
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .map(|(_, raw)| raw.clone())
                    .collect(),
                None => Vec::new(),
            }
        });
        Ok(decode_entries(thread_id, raws))
    }

    async fn range_by_score(
        &self,
        thread_id: &str,
        range: ScoreRange,
        limit: usize,
        order: ScanOrder,
    ) -> StoreResult<Vec<LogEntry>> {
        self.check_read()?;
        let raws = self.raw_members(thread_id, |members| {
            let matching = members.iter().filter(|(score, _)| range.contains(*score));
            match order {
                ScanOrder::Ascending => matching.take(limit).map(|(_, raw)| raw.clone()).collect(),
                ScanOrder::Descending => matching
                    .rev()
                    .take(limit)
                    .map(|(_, raw)| raw.clone())
                    .collect(),
            }
        });
        Ok(decode_entries(thread_id, raws))
    }

    async fn count(&self, thread_id: &str) -> StoreResult<u64> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(thread_id)
            .map(|log| log.members.len() as u64)
            .unwrap_or(0))
    }

    async fn count_in_range(&self, thread_id: &str, range: ScoreRange) -> StoreResult<u64> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(thread_id)
            .map(|log| {
                log.members
                    .iter()
                    .filter(|(score, _)| range.contains(*score))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn upsert_all(&self, thread_id: &str, entries: &[LogEntry]) -> StoreResult<()> {
        self.check_write()?;
        // Build the replacement fully before swapping it in.
        let mut replacement = ThreadLog::default();
        for entry in dedupe_by_id(entries) {
            let member = encode_entry(&entry)?;
            replacement.add(&entry, member);
        }
        let mut inner = self.inner.lock();
        if replacement.members.is_empty() {
            inner.logs.remove(thread_id);
        } else {
            inner.logs.insert(thread_id.to_string(), replacement);
        }
        Ok(())
    }

    async fn insert(&self, entry: &LogEntry) -> StoreResult<bool> {
        self.check_write()?;
        let member = encode_entry(entry)?;
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(entry.thread_id.clone()).or_default();
        if let Some((_, current_raw)) = log.index.get(&entry.id) {
            if let Ok(current) = decode_entry(current_raw) {
                if !entry.supersedes(&current) {
                    return Ok(false);
                }
            }
            log.remove_id(&entry.id);
        }
        log.add(entry, member);
        Ok(true)
    }

    async fn remove(&self, thread_id: &str, entry_id: &str) -> StoreResult<bool> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        Ok(inner
            .logs
            .get_mut(thread_id)
            .map(|log| log.remove_id(entry_id))
            .unwrap_or(false))
    }

    async fn score_of(&self, thread_id: &str, entry_id: &str) -> StoreResult<Option<i64>> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(thread_id)
            .and_then(|log| log.index.get(entry_id))
            .map(|(score, _)| *score))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_write()?;
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.kv.get(key) {
            if existing.expires_at_ms > now {
                return Ok(false);
            }
        }
        inner.kv.insert(
            key.to_string(),
            KvRecord {
                value: value.to_string(),
                expires_at_ms: now + ttl.as_millis() as u64,
            },
        );
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_write()?;
        let now = self.clock.now_ms();
        self.inner.lock().kv.insert(
            key.to_string(),
            KvRecord {
                value: value.to_string(),
                expires_at_ms: now + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_read()?;
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.kv.get(key) {
            Some(record) if record.expires_at_ms > now => Ok(Some(record.value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_write()?;
        let now = self.clock.now_ms();
        let removed = self.inner.lock().kv.remove(key);
        Ok(matches!(removed, Some(record) if record.expires_at_ms > now))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_write()?;
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let matches = matches!(
            inner.kv.get(key),
            Some(record) if record.expires_at_ms > now && record.value == expected
        );
        if matches {
            inner.kv.remove(key);
        }
        Ok(matches)
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn touch(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        stale_before_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check_write()?;
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let set = inner.presence.entry(key.to_string()).or_default();
        if set.expires_at_ms != 0 && set.expires_at_ms <= now {
            set.members.clear();
        }
        set.members.insert(member.to_string(), now_ms);
        set.members.retain(|_, seen| *seen >= stale_before_ms);
        set.expires_at_ms = now + ttl.as_millis() as u64;
        Ok(())
    }

    async fn members_since(&self, key: &str, since_ms: u64) -> StoreResult<Vec<String>> {
        self.check_read()?;
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        let Some(set) = inner.presence.get(key) else {
            return Ok(Vec::new());
        };
        if set.expires_at_ms <= now {
            return Ok(Vec::new());
        }
        let mut members: Vec<(u64, String)> = set
            .members
            .iter()
            .filter(|(_, seen)| **seen >= since_ms)
            .map(|(member, seen)| (*seen, member.clone()))
            .collect();
        members.sort();
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_write()?;
        if let Some(set) = self.inner.lock().presence.get_mut(key) {
            set.members.remove(member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Role;
    use std::sync::Arc;

    fn entry(id: &str, ts: i64) -> LogEntry {
        LogEntry::new(id, "t1", Role::User, id, ts)
    }

    #[tokio::test]
    async fn insert_applies_conflict_policy() {
        let store = MemoryStore::new();
        assert!(store.insert(&entry("m1", 10).with_version(2)).await.unwrap());
        assert!(!store.insert(&entry("m1", 20).with_version(1)).await.unwrap());
        assert!(store.insert(&entry("m1", 5).with_version(3)).await.unwrap());

        assert_eq!(store.count("t1").await.unwrap(), 1);
        assert_eq!(store.score_of("t1", "m1").await.unwrap(), Some(5));
        let all = store.range_by_rank("t1", 0, -1).await.unwrap();
        assert_eq!(all[0].version, 3);
    }

    #[tokio::test]
    async fn failed_upsert_all_keeps_previous_log() {
        let store = MemoryStore::new();
        store
            .upsert_all("t1", &[entry("a", 1), entry("b", 2)])
            .await
            .unwrap();
        store.fail_next_writes(1);
        assert!(store.upsert_all("t1", &[entry("c", 3)]).await.is_err());
        let ids: Vec<String> = store
            .range_by_rank("t1", 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn score_ranges_respect_order_and_limit() {
        let store = MemoryStore::new();
        let entries: Vec<LogEntry> = (0..10).map(|i| entry(&format!("m{i}"), i)).collect();
        store.upsert_all("t1", &entries).await.unwrap();

        let older = store
            .range_by_score("t1", ScoreRange::before(5), 3, ScanOrder::Descending)
            .await
            .unwrap();
        let ids: Vec<&str> = older.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3", "m2"]);
        assert_eq!(
            store
                .count_in_range("t1", ScoreRange::after(7))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn kv_records_expire_on_clock() {
        let clock = ManualClock::new(1_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        assert!(store
            .set_if_absent("lock:r", "a", Duration::from_millis(500))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock:r", "b", Duration::from_millis(500))
            .await
            .unwrap());
        clock.advance_ms(500);
        assert_eq!(store.get("lock:r").await.unwrap(), None);
        assert!(store
            .set_if_absent("lock:r", "b", Duration::from_millis(500))
            .await
            .unwrap());
        assert!(!store.delete_if_equals("lock:r", "a").await.unwrap());
        assert!(store.delete_if_equals("lock:r", "b").await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_fails_reads() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.count("t1").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}

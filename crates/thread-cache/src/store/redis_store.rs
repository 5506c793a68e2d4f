use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::codec::{decode_entries, decode_entry, encode_entry};
use crate::error::StoreResult;
use crate::keys::{messages_index_key, messages_key};
use crate::model::{dedupe_by_id, LogEntry};
use crate::store::{KvStore, LogStore, PresenceStore, ScanOrder, ScoreRange};

/// Members per ZADD/HSET inside the resync transaction.
const UPSERT_CHUNK: usize = 500;

/// Insert-or-replace by id. Keeps the stored entry when it has a higher version, or an equal
/// version with an equal-or-newer timestamp.
static INSERT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current then
  local ok, held = pcall(cjson.decode, current)
  if ok and type(held) == 'table' then
    local held_version = tonumber(held['version']) or 1
    local held_ts = tonumber(held['timestamp']) or 0
    local version = tonumber(ARGV[4])
    local ts = tonumber(ARGV[2])
    if held_version > version or (held_version == version and held_ts >= ts) then
      return 0
    end
  end
  redis.call('ZREM', KEYS[1], current)
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[5])
return 1
"#,
    )
});

static REMOVE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if not current then
  return 0
end
redis.call('ZREM', KEYS[1], current)
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
"#,
    )
});

static DELETE_IF_EQUALS_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    messages_ttl_secs: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, messages_ttl_secs: u64) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            messages_ttl_secs,
        })
    }

    async fn range_raw(
        &self,
        key: &str,
        range: ScoreRange,
        limit: usize,
        order: ScanOrder,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let cmd = match order {
            ScanOrder::Ascending => redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(range.min_arg())
                .arg(range.max_arg())
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .to_owned(),
            ScanOrder::Descending => redis::cmd("ZREVRANGEBYSCORE")
                .arg(key)
                .arg(range.max_arg())
                .arg(range.min_arg())
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .to_owned(),
        };
        let raws: Vec<String> = cmd.query_async(&mut conn).await?;
        Ok(raws)
    }
}

#[async_trait]
impl LogStore for RedisStore {
    async fn range_by_rank(
        &self,
        thread_id: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<LogEntry>> {
        let mut conn = self.redis.clone();
        let raws: Vec<String> = conn.zrange(messages_key(thread_id), start, stop).await?;
        Ok(decode_entries(thread_id, raws))
    }

    async fn range_by_score(
        &self,
        thread_id: &str,
        range: ScoreRange,
        limit: usize,
        order: ScanOrder,
    ) -> StoreResult<Vec<LogEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raws = self
            .range_raw(&messages_key(thread_id), range, limit, order)
            .await?;
        Ok(decode_entries(thread_id, raws))
    }

    async fn count(&self, thread_id: &str) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let count: u64 = conn.zcard(messages_key(thread_id)).await?;
        Ok(count)
    }

    async fn count_in_range(&self, thread_id: &str, range: ScoreRange) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(messages_key(thread_id))
            .arg(range.min_arg())
            .arg(range.max_arg())
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn upsert_all(&self, thread_id: &str, entries: &[LogEntry]) -> StoreResult<()> {
        let key = messages_key(thread_id);
        let index_key = messages_index_key(thread_id);
        let entries = dedupe_by_id(entries);
        let mut members = Vec::with_capacity(entries.len());
        for entry in &entries {
            members.push((entry, encode_entry(entry)?));
        }

        // One MULTI/EXEC: readers see either the old log or the new one.
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore().del(&index_key).ignore();
        for chunk in members.chunks(UPSERT_CHUNK) {
            let scored: Vec<(i64, &str)> = chunk
                .iter()
                .map(|(entry, member)| (entry.timestamp, member.as_str()))
                .collect();
            let indexed: Vec<(&str, &str)> = chunk
                .iter()
                .map(|(entry, member)| (entry.id.as_str(), member.as_str()))
                .collect();
            pipe.zadd_multiple(&key, &scored)
                .ignore()
                .hset_multiple(&index_key, &indexed)
                .ignore();
        }
        if !members.is_empty() {
            pipe.expire(&key, self.messages_ttl_secs as i64)
                .ignore()
                .expire(&index_key, self.messages_ttl_secs as i64)
                .ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn insert(&self, entry: &LogEntry) -> StoreResult<bool> {
        let member = encode_entry(entry)?;
        let mut conn = self.redis.clone();
        let applied: i64 = INSERT_SCRIPT
            .key(messages_key(&entry.thread_id))
            .key(messages_index_key(&entry.thread_id))
            .arg(&entry.id)
            .arg(entry.timestamp)
            .arg(&member)
            .arg(entry.version)
            .arg(self.messages_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn remove(&self, thread_id: &str, entry_id: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = REMOVE_SCRIPT
            .key(messages_key(thread_id))
            .key(messages_index_key(thread_id))
            .arg(entry_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn score_of(&self, thread_id: &str, entry_id: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.redis.clone();
        let member: Option<String> = conn.hget(messages_index_key(thread_id), entry_id).await?;
        Ok(member
            .and_then(|raw| decode_entry(&raw).ok())
            .map(|entry| entry.timestamp))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = DELETE_IF_EQUALS_SCRIPT
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn touch(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        stale_before_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({stale_before_ms}"))
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn members_since(&self, key: &str, since_ms: u64) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(since_ms)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }
}

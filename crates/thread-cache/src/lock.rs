//! Fail-fast distributed locks over the shared key/value store.
//!
//! A lock is a `lock:{resource}` record holding the owner id, created with set-if-absent and an
//! expiry. Acquisition never waits; callers that need exclusivity under contention retry on their
//! own schedule.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::keys::lock_key;
use crate::metrics;
use crate::store::KvStore;

#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    owner_id: String,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, owner_id: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            kv,
            owner_id: owner_id.into(),
            default_ttl,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Try once to take `resource`. Store failures count as "not acquired".
    pub async fn acquire(&self, resource: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self
            .kv
            .set_if_absent(&lock_key(resource), &self.owner_id, ttl)
            .await
        {
            Ok(true) => {
                metrics::LOCK_ATTEMPTS.with_label_values(&["acquired"]).inc();
                info!(resource = %resource, owner = %self.owner_id, ?ttl, "lock acquired");
                true
            }
            Ok(false) => {
                metrics::LOCK_ATTEMPTS.with_label_values(&["contended"]).inc();
                debug!(resource = %resource, owner = %self.owner_id, "lock held elsewhere");
                false
            }
            Err(err) => {
                metrics::LOCK_ATTEMPTS.with_label_values(&["error"]).inc();
                warn!(resource = %resource, error = %err, "lock acquire failed");
                false
            }
        }
    }

    /// Release `resource` if this owner still holds it. Never deletes another owner's lock.
    pub async fn release(&self, resource: &str) -> bool {
        match self
            .kv
            .delete_if_equals(&lock_key(resource), &self.owner_id)
            .await
        {
            Ok(true) => {
                info!(resource = %resource, owner = %self.owner_id, "lock released");
                true
            }
            Ok(false) => {
                debug!(resource = %resource, owner = %self.owner_id, "lock not held by this owner");
                false
            }
            Err(err) => {
                warn!(resource = %resource, error = %err, "lock release failed");
                false
            }
        }
    }

    /// Current holder of `resource`, if any.
    pub async fn holder(&self, resource: &str) -> Option<String> {
        match self.kv.get(&lock_key(resource)).await {
            Ok(holder) => holder,
            Err(err) => {
                warn!(resource = %resource, error = %err, "lock lookup failed");
                None
            }
        }
    }

    /// Run `work` while holding `resource`. Returns `None` without running it when the lock is
    /// taken; the lock is released once `work` finishes.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        ttl: Option<Duration>,
        work: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(resource, ttl).await {
            return None;
        }
        let out = work().await;
        self.release(resource).await;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn managers() -> (ManualClock, Arc<MemoryStore>, LockManager, LockManager) {
        let clock = ManualClock::new(10_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let ttl = Duration::from_millis(5_000);
        let a = LockManager::new(store.clone(), "proc-a", ttl);
        let b = LockManager::new(store.clone(), "proc-b", ttl);
        (clock, store, a, b)
    }

    #[tokio::test]
    async fn second_owner_is_refused_until_release() {
        let (_clock, _store, a, b) = managers();
        assert!(a.acquire("resync:t1", None).await);
        assert!(!b.acquire("resync:t1", None).await);
        assert!(!b.release("resync:t1").await, "B must not release A's lock");
        assert_eq!(a.holder("resync:t1").await.as_deref(), Some("proc-a"));
        assert!(a.release("resync:t1").await);
        assert!(b.acquire("resync:t1", None).await);
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken() {
        let (clock, _store, a, b) = managers();
        assert!(a.acquire("r", Some(Duration::from_millis(1_000))).await);
        clock.advance_ms(1_001);
        assert!(b.acquire("r", None).await);
        assert!(!a.release("r").await);
    }

    #[tokio::test]
    async fn store_failure_is_not_acquired() {
        let (_clock, store, a, _b) = managers();
        store.set_offline(true);
        assert!(!a.acquire("r", None).await);
        assert!(!a.release("r").await);
    }

    #[tokio::test]
    async fn with_lock_skips_when_contended() {
        let (_clock, _store, a, b) = managers();
        assert_eq!(a.with_lock("job", None, || async { 7 }).await, Some(7));
        assert!(b.acquire("job", None).await);
        assert_eq!(a.with_lock("job", None, || async { 7 }).await, None);
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::ClockHandle;
use crate::config::PresenceConfig;
use crate::error::StoreResult;
use crate::keys::presence_key;
use crate::store::PresenceStore;

/// Who is looking at a thread, by heartbeat.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    clock: ClockHandle,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, clock: ClockHandle, config: PresenceConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Record `member` as active on `thread_id` now and prune stale members.
    pub async fn heartbeat(&self, thread_id: &str, member_id: &str) -> StoreResult<()> {
        let now = self.clock.now_ms();
        let stale_before = now.saturating_sub(self.config.stale_after.as_millis() as u64);
        self.store
            .touch(
                &presence_key(thread_id),
                member_id,
                now,
                stale_before,
                self.config.key_ttl,
            )
            .await
    }

    /// Members seen within the staleness window, sorted and de-duplicated. Empty on store failure.
    pub async fn active_members(&self, thread_id: &str) -> Vec<String> {
        let since = self
            .clock
            .now_ms()
            .saturating_sub(self.config.stale_after.as_millis() as u64);
        match self.store.members_since(&presence_key(thread_id), since).await {
            Ok(members) => members
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            Err(err) => {
                warn!(thread = %thread_id, error = %err, "presence lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn leave(&self, thread_id: &str, member_id: &str) -> StoreResult<()> {
        self.store
            .remove_member(&presence_key(thread_id), member_id)
            .await
    }

    /// Heartbeat every configured interval until the handle is aborted.
    pub fn spawn_heartbeat(&self, thread_id: &str, member_id: &str) -> JoinHandle<()> {
        let tracker = self.clone();
        let thread_id = thread_id.to_string();
        let member_id = member_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                match tracker.heartbeat(&thread_id, &member_id).await {
                    Ok(()) => debug!(thread = %thread_id, member = %member_id, "presence heartbeat"),
                    Err(err) => {
                        warn!(thread = %thread_id, member = %member_id, error = %err, "presence heartbeat failed")
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn tracker() -> (ManualClock, Arc<MemoryStore>, PresenceTracker) {
        let clock = ManualClock::new(100_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let tracker = PresenceTracker::new(
            store.clone(),
            Arc::new(clock.clone()),
            PresenceConfig::default(),
        );
        (clock, store, tracker)
    }

    #[tokio::test]
    async fn stale_members_drop_out() {
        let (clock, _store, tracker) = tracker();
        tracker.heartbeat("t1", "alice").await.unwrap();
        clock.advance_ms(20_000);
        tracker.heartbeat("t1", "bob").await.unwrap();
        tracker.heartbeat("t1", "bob").await.unwrap();
        assert_eq!(tracker.active_members("t1").await, vec!["alice", "bob"]);

        clock.advance_ms(15_000);
        assert_eq!(tracker.active_members("t1").await, vec!["bob"]);
    }

    #[tokio::test]
    async fn leave_removes_member() {
        let (_clock, _store, tracker) = tracker();
        tracker.heartbeat("t1", "alice").await.unwrap();
        tracker.leave("t1", "alice").await.unwrap();
        assert!(tracker.active_members("t1").await.is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_is_empty() {
        let (_clock, store, tracker) = tracker();
        tracker.heartbeat("t1", "alice").await.unwrap();
        store.set_offline(true);
        assert!(tracker.active_members("t1").await.is_empty());
        assert!(tracker.heartbeat("t1", "alice").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn background_heartbeat_keeps_member_active() {
        let (clock, _store, tracker) = tracker();
        let handle = tracker.spawn_heartbeat("t1", "alice");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_members("t1").await, vec!["alice"]);
        handle.abort();
        clock.advance_ms(31_000);
        assert!(tracker.active_members("t1").await.is_empty());
    }
}

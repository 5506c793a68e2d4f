//! The explicitly constructed cache service. One `SyncEngine` per process (or per test); nothing
//! here is global.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendHandle;
use crate::clock::{system_clock, ClockHandle};
use crate::coalescer::{FlushSink, StreamCoalescer};
use crate::config::CacheConfig;
use crate::error::{BusResult, CacheError, CacheResult, StoreResult};
use crate::events::SyncEvent;
use crate::keys::{resync_resource, thread_channel, thread_meta_key, OPTIMISTIC_CHANNEL, SYNC_CHANNEL};
use crate::lock::LockManager;
use crate::model::{Anchor, Direction, LogEntry, MessageDraft, PendingKind, ThreadMeta, ViewportWindow};
use crate::notifier::Notifier;
use crate::optimistic::OptimisticManager;
use crate::pending::PendingQueue;
use crate::presence::PresenceTracker;
use crate::store::{build_stores, StoreHandles};
use crate::viewport::ViewportCache;

/// Resyncs pull whole threads from the backend; hold the lock longer than a plain critical section.
const RESYNC_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// The store already holds entries for the thread and no resync was forced.
    AlreadyCached,
    Seeded { entries: u64 },
    /// Another process holds the resync lock.
    Contended,
}

#[derive(Clone)]
pub struct SyncEngine {
    config: CacheConfig,
    clock: ClockHandle,
    stores: StoreHandles,
    backend: BackendHandle,
    notifier: Notifier,
    viewport: Arc<ViewportCache>,
    optimistic: Arc<OptimisticManager>,
    coalescer: StreamCoalescer,
    locks: LockManager,
    presence: PresenceTracker,
    pending: Arc<PendingQueue>,
}

impl SyncEngine {
    pub fn new(
        config: CacheConfig,
        stores: StoreHandles,
        backend: BackendHandle,
        clock: ClockHandle,
    ) -> Self {
        let notifier = Notifier::new(stores.bus.clone(), config.process_id.clone());
        let viewport = Arc::new(ViewportCache::new(stores.log.clone(), config.viewport));
        let pending = Arc::new(PendingQueue::new(config.retry, clock.clone()));
        let optimistic = Arc::new(OptimisticManager::new(
            viewport.clone(),
            stores.log.clone(),
            notifier.clone(),
            pending.clone(),
        ));
        let sink: Arc<dyn FlushSink> = viewport.clone();
        let coalescer = StreamCoalescer::new(sink, config.coalescer);
        let locks = LockManager::new(
            stores.kv.clone(),
            config.process_id.clone(),
            Duration::from_millis(config.lock_ttl_ms),
        );
        let presence = PresenceTracker::new(stores.presence.clone(), clock.clone(), config.presence);
        Self {
            config,
            clock,
            stores,
            backend,
            notifier,
            viewport,
            optimistic,
            coalescer,
            locks,
            presence,
            pending,
        }
    }

    /// Build stores from `config` (Redis or in-memory) and wire an engine over them.
    pub async fn connect(config: CacheConfig, backend: BackendHandle) -> Self {
        let stores = build_stores(&config).await;
        Self::new(config, stores, backend, system_clock())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn process_id(&self) -> &str {
        &self.config.process_id
    }

    pub fn viewport(&self) -> &Arc<ViewportCache> {
        &self.viewport
    }

    pub fn optimistic(&self) -> &Arc<OptimisticManager> {
        &self.optimistic
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn pending(&self) -> &Arc<PendingQueue> {
        &self.pending
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn stores(&self) -> &StoreHandles {
        &self.stores
    }

    // Viewport.

    pub async fn get_viewport(&self, thread_id: &str, anchor: Anchor) -> ViewportWindow {
        self.viewport.get_viewport(thread_id, anchor).await
    }

    pub async fn load_more(
        &self,
        thread_id: &str,
        direction: Direction,
        cursor: &str,
    ) -> Vec<LogEntry> {
        self.viewport.load_more(thread_id, direction, cursor).await
    }

    pub async fn expand_viewport(
        &self,
        thread_id: &str,
        anchor_timestamp: i64,
        direction: Direction,
    ) -> ViewportWindow {
        self.viewport
            .expand_viewport(thread_id, anchor_timestamp, direction)
            .await
    }

    /// Pull the authoritative log into the store. Without `force`, threads that already have
    /// entries are left alone.
    pub async fn seed_thread(&self, thread_id: &str, force: bool) -> CacheResult<SeedOutcome> {
        if !force && self.stores.log.count(thread_id).await? > 0 {
            debug!(thread = %thread_id, "thread already cached; skipping seed");
            return Ok(SeedOutcome::AlreadyCached);
        }
        let resource = resync_resource(thread_id);
        let seeded = self
            .locks
            .with_lock(&resource, Some(RESYNC_LOCK_TTL), || async {
                let entries = self.backend.list_messages(thread_id).await?;
                self.stores.log.upsert_all(thread_id, &entries).await?;
                Ok::<_, CacheError>(entries.len() as u64)
            })
            .await;
        let Some(seeded) = seeded else {
            info!(thread = %thread_id, "resync already running elsewhere");
            return Ok(SeedOutcome::Contended);
        };
        let entries = seeded?;
        self.viewport.invalidate(thread_id);
        info!(thread = %thread_id, entries, "thread resynced");
        self.notifier
            .publish_or_warn(
                SYNC_CHANNEL,
                &SyncEvent::ThreadResynced {
                    thread_id: thread_id.to_string(),
                    entries,
                },
            )
            .await;
        Ok(SeedOutcome::Seeded { entries })
    }

    // Writes.

    pub async fn add_optimistic(&self, entry: LogEntry) -> LogEntry {
        self.optimistic.add_optimistic(entry).await
    }

    pub async fn replace_optimistic(
        &self,
        temp_id: &str,
        confirmed: LogEntry,
    ) -> CacheResult<LogEntry> {
        self.optimistic.replace_optimistic(temp_id, confirmed).await
    }

    pub async fn rollback(&self, temp_id: &str) -> bool {
        self.optimistic.rollback(temp_id).await
    }

    /// Show `draft` immediately and confirm it with the backend in the background. The handle
    /// resolves to the confirmed entry, or to the error that caused the rollback.
    pub async fn send_message(
        &self,
        draft: MessageDraft,
    ) -> (LogEntry, JoinHandle<CacheResult<LogEntry>>) {
        let temp = self
            .optimistic
            .add_optimistic(draft.to_optimistic(self.clock.now_ms() as i64))
            .await;
        let engine = self.clone();
        let temp_id = temp.id.clone();
        let handle = tokio::spawn(async move {
            let payload = serde_json::to_value(&draft).unwrap_or_default();
            let created = engine
                .pending
                .run(PendingKind::CreateMessage, payload, || {
                    let backend = engine.backend.clone();
                    let draft = draft.clone();
                    async move { backend.create_message(draft).await.map_err(CacheError::from) }
                })
                .await;
            match created {
                Ok(confirmed) => engine.optimistic.replace_optimistic(&temp_id, confirmed).await,
                Err(err) => {
                    warn!(temp = %temp_id, error = %err, "message not confirmed; rolling back");
                    engine.optimistic.rollback(&temp_id).await;
                    Err(err)
                }
            }
        });
        (temp, handle)
    }

    /// Feed the latest full content of a streaming entry; `done` flushes it exactly and closes the
    /// stream.
    pub fn stream_update(&self, thread_id: &str, entry_id: &str, content: &str, done: bool) {
        self.coalescer.update(thread_id, entry_id, content, done);
    }

    pub fn spawn_coalescer_sweeper(&self) -> JoinHandle<()> {
        self.coalescer.spawn_sweeper()
    }

    pub async fn update_thread(&self, meta: ThreadMeta) -> CacheResult<ThreadMeta> {
        let payload = serde_json::to_value(&meta).unwrap_or_default();
        let updated = self
            .pending
            .run(PendingKind::UpdateThread, payload, || {
                let backend = self.backend.clone();
                let meta = meta.clone();
                async move { backend.update_thread(meta).await.map_err(CacheError::from) }
            })
            .await?;
        if let Err(err) = self.cache_thread_meta(&updated).await {
            warn!(thread = %updated.thread_id, error = %err, "failed to cache thread metadata");
        }
        self.notifier
            .publish_or_warn(
                &thread_channel(&updated.thread_id),
                &SyncEvent::ThreadUpdated {
                    meta: updated.clone(),
                },
            )
            .await;
        Ok(updated)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> CacheResult<()> {
        self.pending
            .run(
                PendingKind::DeleteThread,
                serde_json::json!({ "thread_id": thread_id }),
                || {
                    let backend = self.backend.clone();
                    let thread_id = thread_id.to_string();
                    async move {
                        backend
                            .delete_thread(&thread_id)
                            .await
                            .map_err(CacheError::from)
                    }
                },
            )
            .await?;
        if let Err(err) = self.forget_thread_meta(thread_id).await {
            warn!(thread = %thread_id, error = %err, "failed to drop thread metadata");
        }
        if let Err(err) = self.stores.log.upsert_all(thread_id, &[]).await {
            warn!(thread = %thread_id, error = %err, "failed to clear cached log");
        }
        self.viewport.invalidate(thread_id);
        let event = SyncEvent::ThreadDeleted {
            thread_id: thread_id.to_string(),
        };
        self.notifier
            .publish_or_warn(&thread_channel(thread_id), &event)
            .await;
        self.notifier.publish_or_warn(SYNC_CHANNEL, &event).await;
        info!(thread = %thread_id, "thread deleted");
        Ok(())
    }

    // Thread metadata.

    pub async fn cache_thread_meta(&self, meta: &ThreadMeta) -> StoreResult<()> {
        let raw = serde_json::to_string(meta)?;
        self.stores
            .kv
            .set_with_ttl(
                &thread_meta_key(&meta.thread_id),
                &raw,
                Duration::from_secs(self.config.thread_meta_ttl_secs),
            )
            .await
    }

    /// Cached metadata, or `None` when absent, expired, malformed or unreachable.
    pub async fn thread_meta(&self, thread_id: &str) -> Option<ThreadMeta> {
        let raw = match self.stores.kv.get(&thread_meta_key(thread_id)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(thread = %thread_id, error = %err, "thread metadata lookup failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(thread = %thread_id, error = %err, "dropping malformed thread metadata");
                None
            }
        }
    }

    pub async fn forget_thread_meta(&self, thread_id: &str) -> StoreResult<bool> {
        self.stores.kv.delete(&thread_meta_key(thread_id)).await
    }

    // Cross-process events.

    /// Apply other processes' entry changes for `thread_id` to the resident window.
    pub async fn watch_thread(&self, thread_id: &str) -> BusResult<JoinHandle<()>> {
        let viewport = self.viewport.clone();
        self.notifier
            .subscribe(&thread_channel(thread_id), move |event| match event {
                SyncEvent::EntryUpserted { entry } => {
                    viewport.apply_entry(entry);
                }
                SyncEvent::EntryRemoved {
                    thread_id,
                    entry_id,
                } => {
                    viewport.remove_entry(&thread_id, &entry_id);
                }
                SyncEvent::ThreadDeleted { thread_id } => {
                    viewport.invalidate(&thread_id);
                }
                other => debug!(kind = other.kind(), thread = %other.thread_id(), "thread event"),
            })
            .await
    }

    /// Mirror other processes' speculative entries.
    pub async fn watch_optimistic(&self) -> BusResult<JoinHandle<()>> {
        let optimistic = self.optimistic.clone();
        self.notifier
            .subscribe(OPTIMISTIC_CHANNEL, move |event| optimistic.apply_remote(event))
            .await
    }

    /// Drop resident windows whose threads were resynced or deleted elsewhere.
    pub async fn watch_sync(&self) -> BusResult<JoinHandle<()>> {
        let viewport = self.viewport.clone();
        self.notifier
            .subscribe(SYNC_CHANNEL, move |event| match event {
                SyncEvent::ThreadResynced { thread_id, .. } | SyncEvent::ThreadDeleted { thread_id } => {
                    if viewport.invalidate(&thread_id) {
                        debug!(thread = %thread_id, "invalidated window after remote resync");
                    }
                }
                other => debug!(kind = other.kind(), "sync event"),
            })
            .await
    }

    // Presence.

    pub async fn heartbeat(&self, thread_id: &str, member_id: &str) -> StoreResult<()> {
        self.presence.heartbeat(thread_id, member_id).await
    }

    pub async fn active_members(&self, thread_id: &str) -> Vec<String> {
        self.presence.active_members(thread_id).await
    }

    pub async fn leave(&self, thread_id: &str, member_id: &str) -> StoreResult<()> {
        self.presence.leave(thread_id, member_id).await
    }

    pub fn spawn_heartbeat(&self, thread_id: &str, member_id: &str) -> JoinHandle<()> {
        self.presence.spawn_heartbeat(thread_id, member_id)
    }

    // Locks.

    pub async fn acquire(&self, resource: &str, ttl: Option<Duration>) -> bool {
        self.locks.acquire(resource, ttl).await
    }

    pub async fn release(&self, resource: &str) -> bool {
        self.locks.release(resource).await
    }
}

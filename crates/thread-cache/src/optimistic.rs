//! Speculative entries shown ahead of backend confirmation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{CacheError, CacheResult, StoreError};
use crate::events::SyncEvent;
use crate::keys::{thread_channel, OPTIMISTIC_CHANNEL};
use crate::model::{Anchor, LogEntry, PendingKind};
use crate::notifier::Notifier;
use crate::pending::PendingQueue;
use crate::store::LogStore;
use crate::viewport::ViewportCache;

pub struct OptimisticManager {
    viewport: Arc<ViewportCache>,
    store: Arc<dyn LogStore>,
    notifier: Notifier,
    pending: Arc<PendingQueue>,
    /// Unconfirmed temp id → thread id.
    speculative: Mutex<HashMap<String, String>>,
}

impl OptimisticManager {
    pub fn new(
        viewport: Arc<ViewportCache>,
        store: Arc<dyn LogStore>,
        notifier: Notifier,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Self {
            viewport,
            store,
            notifier,
            pending,
            speculative: Mutex::new(HashMap::new()),
        }
    }

    /// Show `entry` at the tail of its thread's window and announce it on the optimistic channel.
    /// Nothing is written to the store.
    pub async fn add_optimistic(&self, mut entry: LogEntry) -> LogEntry {
        entry.is_optimistic = true;
        if self.viewport.cached(&entry.thread_id).is_none() {
            self.viewport
                .get_viewport(&entry.thread_id, Anchor::Bottom)
                .await;
        }
        self.viewport.append_tail(entry.clone());
        self.speculative
            .lock()
            .insert(entry.id.clone(), entry.thread_id.clone());
        debug!(thread = %entry.thread_id, entry = %entry.id, "optimistic entry added");
        self.notifier
            .publish_or_warn(
                OPTIMISTIC_CHANNEL,
                &SyncEvent::OptimisticAdded {
                    entry: entry.clone(),
                },
            )
            .await;
        entry
    }

    /// Swap the speculative entry for the confirmed one at the same position, write it to the
    /// store (retrying transient failures), then announce the confirmation. The window is updated
    /// even when the store write ultimately fails; that failure is returned.
    pub async fn replace_optimistic(
        &self,
        temp_id: &str,
        mut confirmed: LogEntry,
    ) -> CacheResult<LogEntry> {
        confirmed.is_optimistic = false;
        self.speculative.lock().remove(temp_id);
        if !self.viewport.replace_in_place(temp_id, confirmed.clone()) {
            self.viewport.apply_entry(confirmed.clone());
        }

        let payload = serde_json::to_value(&confirmed).map_err(StoreError::from)?;
        let written = self
            .pending
            .run(PendingKind::WriteEntry, payload, || {
                let store = Arc::clone(&self.store);
                let entry = confirmed.clone();
                async move { store.insert(&entry).await.map_err(CacheError::from) }
            })
            .await;
        match &written {
            Ok(_) => info!(
                thread = %confirmed.thread_id,
                temp = %temp_id,
                entry = %confirmed.id,
                "optimistic entry confirmed"
            ),
            Err(err) => error!(
                thread = %confirmed.thread_id,
                entry = %confirmed.id,
                error = %err,
                "confirmed entry not written to store"
            ),
        }

        self.notifier
            .publish_or_warn(
                OPTIMISTIC_CHANNEL,
                &SyncEvent::OptimisticConfirmed {
                    temp_id: temp_id.to_string(),
                    entry: confirmed.clone(),
                },
            )
            .await;
        self.notifier
            .publish_or_warn(
                &thread_channel(&confirmed.thread_id),
                &SyncEvent::EntryUpserted {
                    entry: confirmed.clone(),
                },
            )
            .await;
        written.map(|_| confirmed)
    }

    /// Drop a speculative entry that will never be confirmed. Returns false for unknown ids.
    pub async fn rollback(&self, temp_id: &str) -> bool {
        let Some(thread_id) = self.speculative.lock().remove(temp_id) else {
            return false;
        };
        self.viewport.remove_entry(&thread_id, temp_id);
        info!(thread = %thread_id, temp = %temp_id, "optimistic entry rolled back");
        self.notifier
            .publish_or_warn(
                OPTIMISTIC_CHANNEL,
                &SyncEvent::OptimisticRolledBack {
                    thread_id,
                    temp_id: temp_id.to_string(),
                },
            )
            .await;
        true
    }

    /// Mirror another process's speculative entries into resident windows.
    pub fn apply_remote(&self, event: SyncEvent) {
        match event {
            SyncEvent::OptimisticAdded { mut entry } => {
                if self.viewport.cached(&entry.thread_id).is_some() {
                    entry.is_optimistic = true;
                    self.viewport.append_tail(entry);
                }
            }
            SyncEvent::OptimisticConfirmed { temp_id, mut entry } => {
                entry.is_optimistic = false;
                if !self.viewport.replace_in_place(&temp_id, entry.clone()) {
                    self.viewport.apply_entry(entry);
                }
            }
            SyncEvent::OptimisticRolledBack { thread_id, temp_id } => {
                self.viewport.remove_entry(&thread_id, &temp_id);
            }
            other => debug!(kind = other.kind(), "ignoring non-optimistic event"),
        }
    }

    pub fn is_speculative(&self, temp_id: &str) -> bool {
        self.speculative.lock().contains_key(temp_id)
    }
}

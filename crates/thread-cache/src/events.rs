use serde::{Deserialize, Serialize};

use crate::model::{LogEntry, ThreadMeta};

/// Change notifications exchanged between processes observing the same threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncEvent {
    EntryUpserted {
        entry: LogEntry,
    },
    EntryRemoved {
        thread_id: String,
        entry_id: String,
    },
    OptimisticAdded {
        entry: LogEntry,
    },
    OptimisticConfirmed {
        temp_id: String,
        entry: LogEntry,
    },
    OptimisticRolledBack {
        thread_id: String,
        temp_id: String,
    },
    ThreadResynced {
        thread_id: String,
        entries: u64,
    },
    ThreadUpdated {
        meta: ThreadMeta,
    },
    ThreadDeleted {
        thread_id: String,
    },
}

impl SyncEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            SyncEvent::EntryUpserted { entry }
            | SyncEvent::OptimisticAdded { entry }
            | SyncEvent::OptimisticConfirmed { entry, .. } => &entry.thread_id,
            SyncEvent::EntryRemoved { thread_id, .. }
            | SyncEvent::OptimisticRolledBack { thread_id, .. }
            | SyncEvent::ThreadResynced { thread_id, .. }
            | SyncEvent::ThreadDeleted { thread_id } => thread_id,
            SyncEvent::ThreadUpdated { meta } => &meta.thread_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::EntryUpserted { .. } => "entry_upserted",
            SyncEvent::EntryRemoved { .. } => "entry_removed",
            SyncEvent::OptimisticAdded { .. } => "optimistic_added",
            SyncEvent::OptimisticConfirmed { .. } => "optimistic_confirmed",
            SyncEvent::OptimisticRolledBack { .. } => "optimistic_rolled_back",
            SyncEvent::ThreadResynced { .. } => "thread_resynced",
            SyncEvent::ThreadUpdated { .. } => "thread_updated",
            SyncEvent::ThreadDeleted { .. } => "thread_deleted",
        }
    }
}

//! Data model shared by every cache component.
//!
//! A thread's log is an ordered sequence of [`LogEntry`] values sorted by `timestamp`, which doubles
//! as the score in the ordered store. Entries are logically append-only: an edit is a new entry with
//! the same id and a higher `version`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub thread_id: String,
    pub content: String,
    pub role: Role,
    /// Unix milliseconds; the sort score inside the ordered store.
    pub timestamp: i64,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub is_optimistic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_version() -> u64 {
    1
}

impl LogEntry {
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            content: content.into(),
            role,
            timestamp,
            version: default_version(),
            is_optimistic: false,
            metadata: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Conflict policy for two entries sharing an id: the higher version wins, the newer timestamp
    /// breaks ties between equal versions, and a full tie keeps the entry already held.
    pub fn supersedes(&self, current: &LogEntry) -> bool {
        match self.version.cmp(&current.version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.timestamp > current.timestamp,
        }
    }
}

/// Collapse duplicate ids with [`LogEntry::supersedes`] and return the survivors sorted by
/// timestamp.
pub fn dedupe_by_id(entries: &[LogEntry]) -> Vec<LogEntry> {
    let mut by_id: std::collections::HashMap<&str, &LogEntry> =
        std::collections::HashMap::with_capacity(entries.len());
    for entry in entries {
        match by_id.get(entry.id.as_str()) {
            Some(current) if !entry.supersedes(current) => {}
            _ => {
                by_id.insert(entry.id.as_str(), entry);
            }
        }
    }
    let mut out: Vec<LogEntry> = by_id.into_values().cloned().collect();
    out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    out
}

/// Which end of the log a viewport is loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    /// Oldest entries.
    Top,
    /// Newest entries.
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards older entries.
    Up,
    /// Towards newer entries.
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasMore {
    pub top: bool,
    pub bottom: bool,
}

/// A contiguous, order-preserving slice of one thread's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportWindow {
    pub thread_id: String,
    pub entries: Vec<LogEntry>,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_more: HasMore,
}

impl ViewportWindow {
    pub fn empty(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            entries: Vec::new(),
            start_cursor: None,
            end_cursor: None,
            has_more: HasMore::default(),
        }
    }

    pub fn from_entries(
        thread_id: impl Into<String>,
        entries: Vec<LogEntry>,
        has_more: HasMore,
    ) -> Self {
        let mut window = Self {
            thread_id: thread_id.into(),
            entries,
            start_cursor: None,
            end_cursor: None,
            has_more,
        };
        window.refresh_cursors();
        window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, entry_id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == entry_id)
    }

    pub fn get(&self, entry_id: &str) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == entry_id)
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.entries.first().map(|entry| entry.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.entries.last().map(|entry| entry.timestamp)
    }

    pub fn refresh_cursors(&mut self) {
        self.start_cursor = self.entries.first().map(|entry| entry.id.clone());
        self.end_cursor = self.entries.last().map(|entry| entry.id.clone());
    }

    /// Fold `incoming` into the window. Known ids are resolved with the conflict policy, unknown ids
    /// are added, and the result is re-sorted by timestamp. Returns how many new ids were added.
    pub fn merge(&mut self, incoming: Vec<LogEntry>) -> usize {
        let mut added = 0;
        for entry in incoming {
            match self.position(&entry.id) {
                Some(idx) => {
                    if entry.supersedes(&self.entries[idx]) {
                        self.entries[idx] = entry;
                    }
                }
                None => {
                    self.entries.push(entry);
                    added += 1;
                }
            }
        }
        self.entries.sort_by_key(|entry| entry.timestamp);
        self.refresh_cursors();
        added
    }

    /// Append at the tail without re-sorting; used for speculative entries that must stay where
    /// they were shown.
    pub fn push_tail(&mut self, entry: LogEntry) {
        self.entries.push(entry);
        self.refresh_cursors();
    }

    pub fn remove(&mut self, entry_id: &str) -> Option<LogEntry> {
        let idx = self.position(entry_id)?;
        let removed = self.entries.remove(idx);
        self.refresh_cursors();
        Some(removed)
    }

    /// Cap the window at `max` entries, keeping the `keep` end and flagging the dropped side.
    pub fn trim_to(&mut self, max: usize, keep: Anchor) {
        if self.entries.len() <= max {
            return;
        }
        let excess = self.entries.len() - max;
        match keep {
            Anchor::Top => {
                self.entries.truncate(max);
                self.has_more.bottom = true;
            }
            Anchor::Bottom => {
                self.entries.drain(..excess);
                self.has_more.top = true;
            }
        }
        self.refresh_cursors();
    }
}

/// Request to create a message through the authoritative backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessageDraft {
    pub fn new(thread_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            role,
            content: content.into(),
            metadata: None,
        }
    }

    /// The speculative entry shown until the backend confirms the write.
    pub fn to_optimistic(&self, timestamp: i64) -> LogEntry {
        LogEntry {
            id: format!("temp-{}", Uuid::new_v4()),
            thread_id: self.thread_id.clone(),
            content: self.content.clone(),
            role: self.role,
            timestamp,
            version: default_version(),
            is_optimistic: true,
            metadata: self.metadata.clone(),
        }
    }
}

/// Cached thread metadata (`thread:{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub thread_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    CreateMessage,
    WriteEntry,
    UpdateThread,
    DeleteThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Executing,
    Failed,
}

/// A tracked write, visible while in flight and after a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub kind: PendingKind,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
    pub retry_count: u32,
    pub status: PendingStatus,
}

impl PendingOperation {
    pub fn new(kind: PendingKind, payload: serde_json::Value, created_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at_ms,
            retry_count: 0,
            status: PendingStatus::Pending,
        }
    }
}

//! The authoritative system of record that confirmed writes come from.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{system_clock, ClockHandle};
use crate::error::BackendError;
use crate::model::{LogEntry, MessageDraft, ThreadMeta};

pub type BackendHandle = Arc<dyn AuthoritativeBackend>;

#[async_trait]
pub trait AuthoritativeBackend: Send + Sync {
    /// Persist a new message and return it with its server id and timestamp.
    async fn create_message(&self, draft: MessageDraft) -> Result<LogEntry, BackendError>;

    /// Full log of a thread, oldest first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<LogEntry>, BackendError>;

    async fn update_thread(&self, meta: ThreadMeta) -> Result<ThreadMeta, BackendError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
struct BackendState {
    threads: HashMap<String, Vec<LogEntry>>,
    metas: HashMap<String, ThreadMeta>,
    next_id: u64,
    failures: VecDeque<BackendError>,
    calls: u64,
}

/// Process-local backend for tests and the CLI's in-memory mode. Failures queued with
/// [`fail_next`](Self::fail_next) are returned by the following calls, one per call.
pub struct InMemoryBackend {
    clock: ClockHandle,
    state: Mutex<BackendState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: ClockHandle) -> Self {
        Self {
            clock,
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn fail_next(&self, err: BackendError, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.failures.push_back(err.clone());
        }
    }

    /// Seed a thread directly, bypassing failure injection.
    pub fn insert_messages(&self, thread_id: &str, entries: Vec<LogEntry>) {
        let mut state = self.state.lock();
        let log = state.threads.entry(thread_id.to_string()).or_default();
        log.extend(entries);
        log.sort_by_key(|entry| entry.timestamp);
    }

    /// Calls served so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }

    pub fn meta(&self, thread_id: &str) -> Option<ThreadMeta> {
        self.state.lock().metas.get(thread_id).cloned()
    }

    fn begin(&self) -> Result<parking_lot::MutexGuard<'_, BackendState>, BackendError> {
        let mut state = self.state.lock();
        state.calls += 1;
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl AuthoritativeBackend for InMemoryBackend {
    async fn create_message(&self, draft: MessageDraft) -> Result<LogEntry, BackendError> {
        let timestamp = self.clock.now_ms() as i64;
        let mut state = self.begin()?;
        state.next_id += 1;
        let mut entry = LogEntry::new(
            format!("msg-{}", state.next_id),
            draft.thread_id.clone(),
            draft.role,
            draft.content,
            timestamp,
        );
        entry.metadata = draft.metadata;
        state
            .threads
            .entry(draft.thread_id)
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<LogEntry>, BackendError> {
        let state = self.begin()?;
        Ok(state.threads.get(thread_id).cloned().unwrap_or_default())
    }

    async fn update_thread(&self, meta: ThreadMeta) -> Result<ThreadMeta, BackendError> {
        let mut state = self.begin()?;
        state.metas.insert(meta.thread_id.clone(), meta.clone());
        Ok(meta)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), BackendError> {
        let mut state = self.begin()?;
        let had_log = state.threads.remove(thread_id).is_some();
        let had_meta = state.metas.remove(thread_id).is_some();
        if had_log || had_meta {
            Ok(())
        } else {
            Err(BackendError::NotFound(thread_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Role;

    #[tokio::test]
    async fn assigns_ids_and_timestamps() {
        let clock = ManualClock::new(5_000);
        let backend = InMemoryBackend::with_clock(Arc::new(clock.clone()));
        let first = backend
            .create_message(MessageDraft::new("t1", Role::User, "hello"))
            .await
            .unwrap();
        clock.advance_ms(10);
        let second = backend
            .create_message(MessageDraft::new("t1", Role::Assistant, "hi"))
            .await
            .unwrap();
        assert_eq!(first.id, "msg-1");
        assert_eq!(first.timestamp, 5_000);
        assert_eq!(second.timestamp, 5_010);
        let listed = backend.list_messages("t1").await.unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[tokio::test]
    async fn queued_failures_are_served_in_order() {
        let backend = InMemoryBackend::new();
        backend.fail_next(BackendError::RateLimited, 2);
        let draft = MessageDraft::new("t1", Role::User, "x");
        assert!(matches!(
            backend.create_message(draft.clone()).await,
            Err(BackendError::RateLimited)
        ));
        assert!(backend.create_message(draft.clone()).await.is_err());
        assert!(backend.create_message(draft).await.is_ok());
        assert_eq!(backend.calls(), 3);
        assert!(matches!(
            backend.delete_thread("missing").await,
            Err(BackendError::NotFound(_))
        ));
    }
}

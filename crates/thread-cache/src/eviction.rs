//! Access-ordered L1 of per-thread windows. Bounds resident memory independently of how many
//! threads a process has ever opened.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::metrics;
use crate::model::ViewportWindow;

pub struct WindowLru {
    windows: Mutex<LruCache<String, ViewportWindow>>,
}

impl WindowLru {
    pub fn new(max_threads: usize) -> Self {
        let capacity = NonZeroUsize::new(max_threads).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Clone of the cached window, marking it most recently used.
    pub fn get(&self, thread_id: &str) -> Option<ViewportWindow> {
        self.windows.lock().get(thread_id).cloned()
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.windows.lock().contains(thread_id)
    }

    /// Insert or replace a window. Returns the thread evicted to make room, if any.
    pub fn insert(&self, window: ViewportWindow) -> Option<String> {
        let thread_id = window.thread_id.clone();
        let evicted = self.windows.lock().push(thread_id.clone(), window);
        match evicted {
            Some((evicted_id, _)) if evicted_id != thread_id => {
                metrics::VIEWPORT_EVICTIONS.inc();
                debug!(thread = %evicted_id, "evicted viewport window");
                Some(evicted_id)
            }
            _ => None,
        }
    }

    /// Mutate a cached window in place. Returns `None` when the thread is not resident.
    pub fn update<R>(
        &self,
        thread_id: &str,
        apply: impl FnOnce(&mut ViewportWindow) -> R,
    ) -> Option<R> {
        let mut windows = self.windows.lock();
        windows.get_mut(thread_id).map(apply)
    }

    pub fn remove(&self, thread_id: &str) -> Option<ViewportWindow> {
        self.windows.lock().pop(thread_id)
    }

    /// Resident thread ids, most recently used first.
    pub fn thread_ids(&self) -> Vec<String> {
        self.windows.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

//! Per-thread sliding windows over the ordered log (L1).
//!
//! Every read path degrades to the resident window or an empty result when the store fails; store
//! errors never reach callers of this module.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::coalescer::FlushSink;
use crate::config::ViewportLimits;
use crate::error::StoreResult;
use crate::eviction::WindowLru;
use crate::metrics;
use crate::model::{Anchor, Direction, HasMore, LogEntry, ViewportWindow};
use crate::store::{LogStore, ScanOrder, ScoreRange};

/// Extra rank reads allowed when corrupted members shrink the initial window.
const MAX_REREADS: usize = 3;

pub struct ViewportCache {
    store: Arc<dyn LogStore>,
    windows: WindowLru,
    limits: ViewportLimits,
}

impl ViewportCache {
    pub fn new(store: Arc<dyn LogStore>, limits: ViewportLimits) -> Self {
        Self {
            store,
            windows: WindowLru::new(limits.max_cached_threads),
            limits,
        }
    }

    pub fn limits(&self) -> ViewportLimits {
        self.limits
    }

    /// Resident window for `thread_id`, or a freshly loaded one anchored at `anchor`.
    pub async fn get_viewport(&self, thread_id: &str, anchor: Anchor) -> ViewportWindow {
        if let Some(window) = self.windows.get(thread_id) {
            metrics::VIEWPORT_LOOKUPS.with_label_values(&["hit"]).inc();
            debug!(thread = %thread_id, entries = window.len(), "viewport cache hit");
            return window;
        }
        match self.load_initial(thread_id, anchor).await {
            Ok(window) => {
                let label = if window.is_empty() { "empty" } else { "miss" };
                metrics::VIEWPORT_LOOKUPS.with_label_values(&[label]).inc();
                debug!(
                    thread = %thread_id,
                    entries = window.len(),
                    ?anchor,
                    "viewport loaded from store"
                );
                self.windows.insert(window.clone());
                window
            }
            Err(err) => {
                metrics::VIEWPORT_LOOKUPS.with_label_values(&["error"]).inc();
                warn!(thread = %thread_id, error = %err, "viewport load failed; serving empty window");
                ViewportWindow::empty(thread_id)
            }
        }
    }

    async fn load_initial(&self, thread_id: &str, anchor: Anchor) -> StoreResult<ViewportWindow> {
        let total = self.store.count(thread_id).await?;
        if total == 0 {
            return Ok(ViewportWindow::empty(thread_id));
        }
        let size = self.limits.viewport_size;
        // Corrupted members occupy ranks but decode to nothing; widen the read by the shortfall.
        let mut span = size;
        let mut entries = Vec::new();
        for _ in 0..=MAX_REREADS {
            entries = match anchor {
                Anchor::Bottom => {
                    self.store
                        .range_by_rank(thread_id, -(span as isize), -1)
                        .await?
                }
                Anchor::Top => self.store.range_by_rank(thread_id, 0, span as isize - 1).await?,
            };
            if entries.len() >= size || span as u64 >= total {
                break;
            }
            span += size - entries.len();
        }
        let overflow = entries.len() > size || total > span as u64;
        if entries.len() > size {
            match anchor {
                Anchor::Bottom => {
                    entries.drain(..entries.len() - size);
                }
                Anchor::Top => entries.truncate(size),
            }
        }
        let has_more = match anchor {
            Anchor::Bottom => HasMore {
                top: overflow,
                bottom: false,
            },
            Anchor::Top => HasMore {
                top: false,
                bottom: overflow,
            },
        };
        Ok(ViewportWindow::from_entries(thread_id, entries, has_more))
    }

    /// Fetch the next batch beyond `cursor` and fold it into the resident window. A cursor that is no
    /// longer in the window restarts the window from the batch. Returns the fetched entries in
    /// ascending order.
    pub async fn load_more(
        &self,
        thread_id: &str,
        direction: Direction,
        cursor: &str,
    ) -> Vec<LogEntry> {
        let Some(score) = self.resolve_cursor(thread_id, cursor).await else {
            debug!(thread = %thread_id, %cursor, "load_more cursor not found");
            return Vec::new();
        };
        let fetched = match self.fetch_adjacent(thread_id, score, direction).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(thread = %thread_id, %cursor, error = %err, "load_more failed");
                return Vec::new();
            }
        };
        let full_batch = fetched.len() >= self.limits.load_more_batch;
        let max = self.limits.max_window;
        self.windows.update(thread_id, |window| {
            if window.position(cursor).is_none() {
                // A cursor outside the window would leave a gap; restart from the batch instead.
                if fetched.is_empty() {
                    return;
                }
                debug!(thread = %thread_id, %cursor, "cursor outside resident window; rebuilding");
                let has_more = match direction {
                    Direction::Up => HasMore {
                        top: full_batch,
                        bottom: true,
                    },
                    Direction::Down => HasMore {
                        top: true,
                        bottom: full_batch,
                    },
                };
                *window = ViewportWindow::from_entries(thread_id, fetched.clone(), has_more);
                return;
            }
            let (first, last) = (window.first_timestamp(), window.last_timestamp());
            let extends_top = fetched
                .first()
                .zip(first)
                .is_some_and(|(entry, first)| entry.timestamp < first);
            let extends_bottom = fetched
                .last()
                .zip(last)
                .is_some_and(|(entry, last)| entry.timestamp > last);
            window.merge(fetched.clone());
            match direction {
                Direction::Up => {
                    if extends_top {
                        window.has_more.top = full_batch;
                    } else if !full_batch {
                        window.has_more.top = false;
                    }
                    window.trim_to(max, Anchor::Top);
                }
                Direction::Down => {
                    if extends_bottom {
                        window.has_more.bottom = full_batch;
                    } else if !full_batch {
                        window.has_more.bottom = false;
                    }
                    window.trim_to(max, Anchor::Bottom);
                }
            }
        });
        fetched
    }

    /// Like [`load_more`](Self::load_more) but keyed by timestamp, creating the window when the
    /// thread is not resident, and recomputing both `has_more` flags with exact range counts. A
    /// batch separated from the resident window by unloaded entries replaces the window.
    pub async fn expand_viewport(
        &self,
        thread_id: &str,
        anchor_timestamp: i64,
        direction: Direction,
    ) -> ViewportWindow {
        let fetched = match self
            .fetch_adjacent(thread_id, anchor_timestamp, direction)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(thread = %thread_id, error = %err, "expand_viewport failed");
                return self
                    .windows
                    .get(thread_id)
                    .unwrap_or_else(|| ViewportWindow::empty(thread_id));
            }
        };

        let contiguous = match self.windows.get(thread_id) {
            Some(resident) => match self.joins_window(thread_id, &resident, &fetched).await {
                Ok(joins) => joins,
                Err(err) => {
                    warn!(thread = %thread_id, error = %err, "expand_viewport gap check failed");
                    return resident;
                }
            },
            None => false,
        };

        let max = self.limits.max_window;
        let keep = match direction {
            Direction::Up => Anchor::Top,
            Direction::Down => Anchor::Bottom,
        };
        let merged = if contiguous {
            self.windows.update(thread_id, |window| {
                window.merge(fetched.clone());
                window.trim_to(max, keep);
                window.clone()
            })
        } else {
            None
        };
        let resident = merged.is_some();
        let mut window = match merged {
            Some(window) => window,
            None => {
                debug!(thread = %thread_id, anchor_timestamp, "starting a fresh window at the anchor");
                let mut window = ViewportWindow::from_entries(thread_id, fetched, HasMore::default());
                window.trim_to(max, keep);
                window
            }
        };

        let (lower, upper) = match (window.first_timestamp(), window.last_timestamp()) {
            (Some(first), Some(last)) => (first, last),
            _ => (anchor_timestamp, anchor_timestamp),
        };
        let counts = async {
            let above = self
                .store
                .count_in_range(thread_id, ScoreRange::before(lower))
                .await?;
            let below = self
                .store
                .count_in_range(thread_id, ScoreRange::after(upper))
                .await?;
            Ok::<_, crate::error::StoreError>((above, below))
        }
        .await;
        match counts {
            Ok((above, below)) => {
                window.has_more = HasMore {
                    top: above > 0,
                    bottom: below > 0,
                };
                let has_more = window.has_more;
                let refreshed = resident
                    && self
                        .windows
                        .update(thread_id, |current| {
                            // Only stamp exact counts onto the window they were computed for.
                            if current.first_timestamp() == window.first_timestamp()
                                && current.last_timestamp() == window.last_timestamp()
                            {
                                current.has_more = has_more;
                            }
                        })
                        .is_some();
                if !refreshed {
                    self.windows.insert(window.clone());
                }
            }
            Err(err) => {
                warn!(thread = %thread_id, error = %err, "expand_viewport count failed");
                if !resident {
                    self.windows.insert(window.clone());
                }
            }
        }
        window
    }

    /// Whether `fetched` can be folded into `window` without leaving store entries between them.
    async fn joins_window(
        &self,
        thread_id: &str,
        window: &ViewportWindow,
        fetched: &[LogEntry],
    ) -> StoreResult<bool> {
        let (Some(first), Some(last)) = (window.first_timestamp(), window.last_timestamp()) else {
            return Ok(true);
        };
        let (Some(low), Some(high)) = (fetched.first(), fetched.last()) else {
            return Ok(true);
        };
        let gap = if high.timestamp < first {
            ScoreRange::between(high.timestamp, first)
        } else if low.timestamp > last {
            ScoreRange::between(last, low.timestamp)
        } else {
            return Ok(true);
        };
        Ok(self.store.count_in_range(thread_id, gap).await? == 0)
    }

    async fn resolve_cursor(&self, thread_id: &str, cursor: &str) -> Option<i64> {
        let resident = self
            .windows
            .update(thread_id, |window| window.get(cursor).map(|entry| entry.timestamp))
            .flatten();
        if resident.is_some() {
            return resident;
        }
        match self.store.score_of(thread_id, cursor).await {
            Ok(score) => score,
            Err(err) => {
                warn!(thread = %thread_id, %cursor, error = %err, "cursor lookup failed");
                None
            }
        }
    }

    async fn fetch_adjacent(
        &self,
        thread_id: &str,
        score: i64,
        direction: Direction,
    ) -> StoreResult<Vec<LogEntry>> {
        let batch = self.limits.load_more_batch;
        match direction {
            Direction::Up => {
                let mut older = self
                    .store
                    .range_by_score(
                        thread_id,
                        ScoreRange::before(score),
                        batch,
                        ScanOrder::Descending,
                    )
                    .await?;
                older.reverse();
                Ok(older)
            }
            Direction::Down => {
                self.store
                    .range_by_score(thread_id, ScoreRange::after(score), batch, ScanOrder::Ascending)
                    .await
            }
        }
    }

    /// Resident window without loading; touches LRU order.
    pub fn cached(&self, thread_id: &str) -> Option<ViewportWindow> {
        self.windows.get(thread_id)
    }

    pub fn cached_threads(&self) -> Vec<String> {
        self.windows.thread_ids()
    }

    pub fn invalidate(&self, thread_id: &str) -> bool {
        self.windows.remove(thread_id).is_some()
    }

    /// Fold an entry that exists in the store (confirmed locally or announced by another process)
    /// into the resident window. Entries beyond an unloaded boundary only flip `has_more`.
    pub fn apply_entry(&self, entry: LogEntry) -> bool {
        let max = self.limits.max_window;
        let thread_id = entry.thread_id.clone();
        self.windows
            .update(&thread_id, |window| {
                if let Some(idx) = window.position(&entry.id) {
                    if entry.supersedes(&window.entries[idx]) {
                        window.entries[idx] = entry;
                        return true;
                    }
                    return false;
                }
                let (first, last) = match (window.first_timestamp(), window.last_timestamp()) {
                    (Some(first), Some(last)) => (first, last),
                    _ => {
                        window.merge(vec![entry]);
                        return true;
                    }
                };
                if entry.timestamp > last && window.has_more.bottom {
                    return false;
                }
                if entry.timestamp < first && window.has_more.top {
                    return false;
                }
                let older = entry.timestamp < first;
                window.merge(vec![entry]);
                window.trim_to(max, if older { Anchor::Top } else { Anchor::Bottom });
                true
            })
            .unwrap_or(false)
    }

    pub fn remove_entry(&self, thread_id: &str, entry_id: &str) -> Option<LogEntry> {
        self.windows
            .update(thread_id, |window| window.remove(entry_id))
            .flatten()
    }

    /// Replace the visible content of one entry; the streaming sink.
    pub fn update_content(&self, thread_id: &str, entry_id: &str, content: &str) -> bool {
        self.windows
            .update(thread_id, |window| {
                match window.entries.iter_mut().find(|entry| entry.id == entry_id) {
                    Some(entry) => {
                        entry.content = content.to_string();
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    /// Append a speculative entry at the tail, keeping the window bounded. When the thread is not
    /// resident a one-entry window is started (flagged as having older entries) and `false` is
    /// returned.
    pub fn append_tail(&self, entry: LogEntry) -> bool {
        let max = self.limits.max_window;
        let thread_id = entry.thread_id.clone();
        let mut entry = Some(entry);
        let appended = self
            .windows
            .update(&thread_id, |window| {
                if let Some(entry) = entry.take() {
                    window.push_tail(entry);
                }
                window.trim_to(max, Anchor::Bottom);
            })
            .is_some();
        if let Some(entry) = entry {
            let has_more = HasMore {
                top: true,
                bottom: false,
            };
            self.windows
                .insert(ViewportWindow::from_entries(thread_id, vec![entry], has_more));
        }
        appended
    }

    /// Swap `temp_id` for `confirmed` at the same position. Any other copy of the confirmed id is
    /// dropped so ids stay unique.
    pub fn replace_in_place(&self, temp_id: &str, confirmed: LogEntry) -> bool {
        let thread_id = confirmed.thread_id.clone();
        self.windows
            .update(&thread_id, |window| {
                let Some(idx) = window.position(temp_id) else {
                    return false;
                };
                let confirmed_id = confirmed.id.clone();
                window.entries[idx] = confirmed;
                let mut position = 0;
                window.entries.retain(|entry| {
                    let keep = position == idx || entry.id != confirmed_id;
                    position += 1;
                    keep
                });
                window.refresh_cursors();
                true
            })
            .unwrap_or(false)
    }
}

impl FlushSink for ViewportCache {
    fn flush(&self, thread_id: &str, entry_id: &str, content: &str) {
        if !self.update_content(thread_id, entry_id, content) {
            debug!(thread = %thread_id, entry = %entry_id, "stream flush for non-resident entry");
        }
    }
}

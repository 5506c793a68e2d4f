//! Rate-limits visible updates to streaming entries.
//!
//! Each stream (thread id + entry id) flushes at most once per interval. Updates inside the
//! interval overwrite a buffer and arm one deferred flush for the end of the interval. A forced
//! update flushes the exact content and closes the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CoalescerConfig;
use crate::metrics;
use crate::scheduler::DeferredTask;

/// Receives visible content for a stream.
pub trait FlushSink: Send + Sync {
    fn flush(&self, thread_id: &str, entry_id: &str, content: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    thread_id: String,
    entry_id: String,
}

struct StreamState {
    buffered: Option<String>,
    last_flush: Option<Instant>,
    last_touch: Instant,
    generation: u64,
    deferred: DeferredTask,
}

type Streams = Arc<Mutex<HashMap<StreamKey, StreamState>>>;

#[derive(Clone)]
pub struct StreamCoalescer {
    sink: Arc<dyn FlushSink>,
    config: CoalescerConfig,
    streams: Streams,
}

impl StreamCoalescer {
    pub fn new(sink: Arc<dyn FlushSink>, config: CoalescerConfig) -> Self {
        Self {
            sink,
            config,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Offer the latest full content of a stream.
    pub fn update(&self, thread_id: &str, entry_id: &str, content: &str, force: bool) {
        let key = StreamKey {
            thread_id: thread_id.to_string(),
            entry_id: entry_id.to_string(),
        };
        let now = Instant::now();
        let mut streams = self.streams.lock();

        if force {
            if let Some(state) = streams.remove(&key) {
                state.deferred.cancel();
            }
            self.sink.flush(thread_id, entry_id, content);
            metrics::COALESCER_FLUSHES
                .with_label_values(&["forced"])
                .inc();
            debug!(thread = %thread_id, entry = %entry_id, "stream closed");
            return;
        }

        let state = streams.entry(key.clone()).or_insert_with(|| StreamState {
            buffered: None,
            last_flush: None,
            last_touch: now,
            generation: 0,
            deferred: DeferredTask::new(),
        });
        state.last_touch = now;
        state.generation += 1;

        let elapsed = state.last_flush.map(|last| now.saturating_duration_since(last));
        let due = elapsed.map_or(true, |elapsed| elapsed >= self.config.interval);
        if due {
            state.deferred.cancel();
            state.buffered = None;
            state.last_flush = Some(now);
            self.sink.flush(thread_id, entry_id, content);
            metrics::COALESCER_FLUSHES
                .with_label_values(&["immediate"])
                .inc();
            return;
        }

        state.buffered = Some(content.to_string());
        let delay = self
            .config
            .interval
            .saturating_sub(elapsed.unwrap_or_default());
        let ticket = state.generation;
        let streams = Arc::clone(&self.streams);
        let sink = Arc::clone(&self.sink);
        state.deferred.schedule(delay, async move {
            flush_deferred(&streams, sink.as_ref(), &key, ticket);
        });
        trace!(thread = %thread_id, entry = %entry_id, ?delay, "stream update buffered");
    }

    /// Drop streams untouched for longer than the idle timeout. Returns how many were dropped.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|key, state| {
            let keep = now.saturating_duration_since(state.last_touch) <= idle_timeout;
            if !keep {
                state.deferred.cancel();
                debug!(thread = %key.thread_id, entry = %key.entry_id, "dropping idle stream");
            }
            keep
        });
        before - streams.len()
    }

    /// Periodically run [`sweep_idle`](Self::sweep_idle) until the handle is aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let coalescer = self.clone();
        let period = self.config.sweep_period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = coalescer.sweep_idle();
                if dropped > 0 {
                    debug!(dropped, "swept idle streams");
                }
            }
        })
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

fn flush_deferred(streams: &Streams, sink: &dyn FlushSink, key: &StreamKey, ticket: u64) {
    let mut streams = streams.lock();
    let Some(state) = streams.get_mut(key) else {
        return;
    };
    // A newer update re-armed the flush; that job owns the buffer now.
    if state.generation != ticket {
        return;
    }
    let Some(content) = state.buffered.take() else {
        return;
    };
    state.last_flush = Some(Instant::now());
    sink.flush(&key.thread_id, &key.entry_id, &content);
    metrics::COALESCER_FLUSHES
        .with_label_values(&["deferred"])
        .inc();
}

//! Client-resident cache and synchronization engine for ordered per-thread logs.
//!
//! A [`SyncEngine`] keeps a bounded viewport of each open thread in memory, backed by an ordered
//! store shared with other processes (Redis, or an in-memory stand-in), and coordinates those
//! processes through locks, presence and pub/sub events.

pub mod backend;
pub mod clock;
pub mod coalescer;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod eviction;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod optimistic;
pub mod pending;
pub mod presence;
pub mod scheduler;
pub mod store;
pub mod viewport;

pub use backend::{AuthoritativeBackend, BackendHandle, InMemoryBackend};
pub use clock::{Clock, ClockHandle, ManualClock, SystemClock};
pub use config::{CacheConfig, StoreBackend};
pub use engine::{SeedOutcome, SyncEngine};
pub use error::{BackendError, BusError, CacheError, CacheResult, StoreError, Transience};
pub use events::SyncEvent;
pub use model::{
    Anchor, Direction, HasMore, LogEntry, MessageDraft, PendingOperation, Role, ThreadMeta,
    ViewportWindow,
};
pub use notifier::{Bus, LocalBus, Notifier, RedisBus};
pub use store::{build_stores, KvStore, LogStore, MemoryStore, PresenceStore, RedisStore, StoreHandles};

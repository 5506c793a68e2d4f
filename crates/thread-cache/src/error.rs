use thiserror::Error;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (network blip, timeout, rate limiting).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Unavailable(_) => Transience::Retryable,
            StoreError::Redis(err) => {
                if err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                {
                    Transience::Retryable
                } else {
                    Transience::Unknown
                }
            }
            StoreError::Serde(_) => Transience::Permanent,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by the authoritative backend collaborator.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rate limited")]
    RateLimited,
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub fn transience(&self) -> Transience {
        match self {
            BackendError::Unavailable(_) | BackendError::RateLimited => Transience::Retryable,
            BackendError::Rejected(_) | BackendError::NotFound(_) => Transience::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("operation {op_id} failed after {attempts} attempts")]
    RetriesExhausted {
        op_id: String,
        attempts: u32,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    pub fn transience(&self) -> Transience {
        match self {
            CacheError::Store(err) => err.transience(),
            CacheError::Backend(err) => err.transience(),
            CacheError::Bus(_) => Transience::Retryable,
            CacheError::RetriesExhausted { .. } => Transience::Permanent,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

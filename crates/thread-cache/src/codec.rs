//! Parse boundary between raw store payloads and [`LogEntry`] values.

use thiserror::Error;
use tracing::warn;

use crate::metrics;
use crate::model::LogEntry;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("entry id is empty")]
    EmptyId,
}

pub fn encode_entry(entry: &LogEntry) -> Result<String, serde_json::Error> {
    serde_json::to_string(entry)
}

/// Strict decode: required fields must be present with the right types.
pub fn decode_entry(raw: &str) -> Result<LogEntry, DecodeError> {
    let entry: LogEntry = serde_json::from_str(raw)?;
    if entry.id.trim().is_empty() {
        return Err(DecodeError::EmptyId);
    }
    Ok(entry)
}

/// Decode a batch of raw members, dropping the ones that fail. A corrupted member never fails the
/// surrounding query.
pub fn decode_entries<I, S>(thread_id: &str, raws: I) -> Vec<LogEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raws.into_iter()
        .filter_map(|raw| match decode_entry(raw.as_ref()) {
            Ok(entry) => Some(entry),
            Err(err) => {
                metrics::DECODE_REJECTED.inc();
                warn!(
                    thread = %thread_id,
                    bytes = raw.as_ref().len(),
                    error = %err,
                    "dropping malformed log entry"
                );
                None
            }
        })
        .collect()
}

//! Store key and pub/sub topic names.
//!
//! Thread and resource identifiers are spliced in verbatim and never interpreted: no glob, pattern
//! or script text is ever built from them, they only travel as key arguments.

pub const OPTIMISTIC_CHANNEL: &str = "channel:optimistic";
pub const SYNC_CHANNEL: &str = "channel:sync";

pub fn thread_meta_key(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

pub fn messages_key(thread_id: &str) -> String {
    format!("messages:{thread_id}")
}

/// Id → serialized member index kept alongside the ordered log.
pub fn messages_index_key(thread_id: &str) -> String {
    format!("messages:{thread_id}:index")
}

pub fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

pub fn presence_key(thread_id: &str) -> String {
    format!("presence:{thread_id}")
}

pub fn thread_channel(thread_id: &str) -> String {
    format!("channel:thread:{thread_id}")
}

/// Lock resource guarding a full-thread resync.
pub fn resync_resource(thread_id: &str) -> String {
    format!("resync:{thread_id}")
}

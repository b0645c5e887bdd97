//! Key-value entries
//!
//! A bucket is a stream of revisions per key; an entry is one revision.
//! Deletes and purges are stored as tombstone revisions marked by an
//! operation header, so history and watches see them like any other write.

use bytes::Bytes;

use crate::jetstream::JsMsg;
use crate::protocol::headers::{HeaderMap, HDR_KV_OPERATION};

/// What a revision did to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Wrote a value
    Put,
    /// Tombstone: the key was deleted, history retained
    Delete,
    /// Tombstone: the key was purged, prior revisions dropped
    Purge,
}

impl Operation {
    /// Header value stored with tombstone revisions
    pub(crate) fn header_value(self) -> Option<&'static str> {
        match self {
            Operation::Put => None,
            Operation::Delete => Some("DEL"),
            Operation::Purge => Some("PURGE"),
        }
    }

    pub(crate) fn from_headers(headers: Option<&HeaderMap>) -> Self {
        match headers.and_then(|h| h.get(HDR_KV_OPERATION)) {
            Some("DEL") => Operation::Delete,
            Some("PURGE") => Operation::Purge,
            _ => Operation::Put,
        }
    }

    /// Whether this revision hides the key from reads
    pub fn is_tombstone(self) -> bool {
        !matches!(self, Operation::Put)
    }
}

/// One revision of one key
#[derive(Debug, Clone)]
pub struct Entry {
    /// Bucket the key lives in
    pub bucket: String,
    /// Key within the bucket
    pub key: String,
    /// Stored value; empty for tombstones
    pub value: Bytes,
    /// Monotonic revision (the backing stream sequence)
    pub revision: u64,
    /// What this revision did
    pub operation: Operation,
    /// Entries remaining after this one in the current replay
    pub delta: u64,
}

impl Entry {
    /// Build from a stream delivery whose subject starts with the bucket
    /// prefix; `None` when the subject does not belong to the bucket
    pub(crate) fn from_delivery(msg: &JsMsg, bucket: &str, prefix: &str) -> Option<Self> {
        let key = msg.subject().strip_prefix(prefix)?;
        Some(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: msg.payload().clone(),
            revision: msg.info().stream_sequence,
            operation: Operation::from_headers(msg.headers()),
            delta: msg.info().pending,
        })
    }
}

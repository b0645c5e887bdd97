//! Client statistics
//!
//! Lightweight counters maintained by the connection driver and read loop.
//! Cheap to update (relaxed atomics) and read via [`ClientStats::snapshot`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one client
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Messages delivered to this client
    pub(crate) msgs_in: AtomicU64,
    /// Messages published by this client
    pub(crate) msgs_out: AtomicU64,
    /// Payload and frame bytes read from the transport
    pub(crate) bytes_in: AtomicU64,
    /// Payload and frame bytes written to the transport
    pub(crate) bytes_out: AtomicU64,
    /// Successful handshakes (first connect included)
    pub(crate) connects: AtomicU64,
    /// Reconnects after a dropped transport
    pub(crate) reconnects: AtomicU64,
    /// Bytes currently buffered while disconnected
    pub(crate) buffered_bytes: AtomicUsize,
}

/// Point-in-time view of [`ClientStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages delivered to this client
    pub msgs_in: u64,
    /// Messages published by this client
    pub msgs_out: u64,
    /// Bytes read from the transport
    pub bytes_in: u64,
    /// Bytes written to the transport
    pub bytes_out: u64,
    /// Successful handshakes
    pub connects: u64,
    /// Reconnects after a dropped transport
    pub reconnects: u64,
    /// Bytes currently buffered while disconnected
    pub buffered_bytes: usize,
}

impl ClientStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_in(&self, msgs: u64, bytes: u64) {
        self.msgs_in.fetch_add(msgs, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_out(&self, msgs: u64, bytes: u64) {
        self.msgs_out.fetch_add(msgs, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_buffered(&self, bytes: usize) {
        self.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn clear_buffered(&self) {
        self.buffered_bytes.store(0, Ordering::Relaxed);
    }

    /// Capture the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            msgs_in: self.msgs_in.load(Ordering::Relaxed),
            msgs_out: self.msgs_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
        }
    }
}

//! Request/reply inbox multiplexing
//!
//! All requests share one wildcard subscription (`<prefix>.<client>.>`).
//! Each call gets a unique reply subject under that prefix and a pending
//! oneshot slot keyed by the final token; the driver resolves the slot when
//! the reply lands on the wildcard sid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::protocol::Message;

/// Length of the random client token in the inbox prefix
const CLIENT_TOKEN_LEN: usize = 12;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random inbox token
pub(crate) fn random_token(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Pending request/reply calls for one client
#[derive(Debug)]
pub(crate) struct RequestMap {
    /// `<inbox_prefix>.<client token>`, unique per client instance
    prefix: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
}

impl RequestMap {
    pub(crate) fn new(inbox_prefix: &str) -> Self {
        Self {
            prefix: format!("{}.{}", inbox_prefix, random_token(CLIENT_TOKEN_LEN)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Subject for the shared wildcard subscription
    pub(crate) fn wildcard_subject(&self) -> String {
        format!("{}.>", self.prefix)
    }

    /// Register one pending request; returns its reply subject and the
    /// receiver the reply will arrive on
    pub(crate) fn new_request(&self) -> (String, oneshot::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        (format!("{}.{}", self.prefix, id), rx)
    }

    /// Resolve the pending request a reply subject addresses, if any
    ///
    /// Late replies for timed-out or duplicate-answered requests are
    /// silently dropped.
    pub(crate) fn resolve(&self, reply_subject: &str, msg: Message) {
        let Some(id) = self.parse_id(reply_subject) else {
            tracing::debug!(subject = %reply_subject, "reply for unknown inbox shape");
            return;
        };
        let slot = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        if let Some(tx) = slot {
            let _ = tx.send(msg);
        }
    }

    /// Drop a pending slot after timeout or caller cancellation
    pub(crate) fn cancel(&self, reply_subject: &str) {
        if let Some(id) = self.parse_id(reply_subject) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
        }
    }

    /// Fail every pending request by dropping its sender
    pub(crate) fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn parse_id(&self, reply_subject: &str) -> Option<u64> {
        let rest = reply_subject.strip_prefix(&self.prefix)?;
        rest.strip_prefix('.')?.parse().ok()
    }
}

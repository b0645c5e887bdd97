//! Subscription bookkeeping
//!
//! Owned exclusively by the connection driver task, so no lock is needed:
//! every mutation arrives as a command or a decoded frame on the driver's
//! select loop. Sids are allocated once per client and never reused, which
//! keeps late deliveries for a dead sid harmless.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{codec, Message};

/// Where deliveries for one sid go
#[derive(Debug)]
pub(crate) enum Sink {
    /// A subscriber handle draining an mpsc channel
    Channel(mpsc::Sender<Message>),
    /// The request/reply inbox wildcard; routed by reply token instead
    Request,
}

/// Outcome of routing one delivery
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Handed to a subscriber channel
    Delivered,
    /// Belongs to the request inbox; the caller resolves the pending
    /// request the reply subject addresses
    Request(Message),
    /// Subscriber channel was full, message dropped
    Dropped {
        /// Sid of the overwhelmed subscription
        sid: u64,
        /// Its subject
        subject: String,
    },
    /// Subscriber side is gone or the sid is unknown
    Ignored,
}

#[derive(Debug)]
struct SubEntry {
    subject: String,
    queue_group: Option<String>,
    sink: Sink,
    /// Deliveries made so far, counted against an UNSUB cap
    delivered: u64,
    /// Deliveries left before auto-removal, when capped by UNSUB <max>
    remaining: Option<u64>,
    /// Set after the first drop so the slow-consumer event fires once
    slow_reported: bool,
}

/// All live subscriptions for one client, keyed by sid
///
/// Sids are allocated by the client handle from a shared counter and are
/// never reused. A `BTreeMap` keeps iteration in sid order, which is also
/// creation order; resubscription after a reconnect replays in that order.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subs: BTreeMap<u64, SubEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subs: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        sink: Sink,
    ) {
        self.subs.insert(
            sid,
            SubEntry {
                subject,
                queue_group,
                sink,
                delivered: 0,
                remaining: None,
                slow_reported: false,
            },
        );
    }

    pub(crate) fn remove(&mut self, sid: u64) {
        self.subs.remove(&sid);
    }

    pub(crate) fn contains(&self, sid: u64) -> bool {
        self.subs.contains_key(&sid)
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }

    /// Cap a subscription at `max` total deliveries, counting those already
    /// made; removes it immediately if the cap is already met
    ///
    /// Returns the remaining count to put on the wire, or `None` when the
    /// sid is unknown.
    pub(crate) fn set_max(&mut self, sid: u64, max: u64) -> Option<u64> {
        let entry = self.subs.get_mut(&sid)?;
        if entry.delivered >= max {
            self.subs.remove(&sid);
            return Some(0);
        }
        let remaining = max - entry.delivered;
        entry.remaining = Some(remaining);
        Some(remaining)
    }

    /// Route one decoded message to its subscription
    pub(crate) fn dispatch(&mut self, msg: Message) -> Delivery {
        let sid = msg.sid();
        let Some(entry) = self.subs.get_mut(&sid) else {
            return Delivery::Ignored;
        };

        let outcome = match &entry.sink {
            Sink::Request => Delivery::Request(msg),
            Sink::Channel(tx) => match tx.try_send(msg) {
                Ok(()) => Delivery::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if entry.slow_reported {
                        Delivery::Ignored
                    } else {
                        entry.slow_reported = true;
                        Delivery::Dropped {
                            sid,
                            subject: entry.subject.clone(),
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.subs.remove(&sid);
                    return Delivery::Ignored;
                }
            },
        };

        // A successful delivery counts against an UNSUB cap
        if matches!(outcome, Delivery::Delivered | Delivery::Request(_)) {
            entry.delivered += 1;
            if let Some(remaining) = &mut entry.remaining {
                *remaining -= 1;
                if *remaining == 0 {
                    self.subs.remove(&sid);
                }
            }
        }
        outcome
    }

    /// SUB frames recreating every live subscription, in sid order,
    /// followed by UNSUB caps for the capped ones
    pub(crate) fn resubscribe_frames(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(self.subs.len());
        for (sid, entry) in &self.subs {
            frames.push(codec::encode_subscribe(
                &entry.subject,
                entry.queue_group.as_deref(),
                *sid,
            ));
            if let Some(remaining) = entry.remaining {
                frames.push(codec::encode_unsubscribe(*sid, Some(remaining)));
            }
        }
        frames
    }

    /// UNSUB frames for every live subscription, used by drain
    pub(crate) fn unsubscribe_all_frames(&self) -> Vec<Bytes> {
        self.subs
            .keys()
            .map(|sid| codec::encode_unsubscribe(*sid, None))
            .collect()
    }

    /// Drop all channel sinks so subscriber handles see end-of-stream
    pub(crate) fn clear(&mut self) {
        self.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as B;

    fn msg(sid: u64) -> Message {
        Message {
            subject: "t".to_string(),
            reply: None,
            headers: None,
            payload: B::from_static(b"x"),
            status: None,
            description: None,
            sid,
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_channel() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        let (tx, mut rx) = mpsc::channel(4);
        reg.insert(sid, "t".to_string(), None, Sink::Channel(tx));

        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Delivered));
        assert!(rx.recv().await.is_some());
        assert!(matches!(reg.dispatch(msg(999)), Delivery::Ignored));
    }

    #[tokio::test]
    async fn test_full_channel_reports_drop_once() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        let (tx, _rx) = mpsc::channel(1);
        reg.insert(sid, "t".to_string(), None, Sink::Channel(tx));

        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Delivered));
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Dropped { .. }));
        // Subsequent drops stay quiet
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Ignored));
    }

    #[test]
    fn test_request_sink_returns_message() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        reg.insert(sid, "_INBOX.x.>".to_string(), None, Sink::Request);

        match reg.dispatch(msg(sid)) {
            Delivery::Request(m) => assert_eq!(&m.payload[..], b"x"),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_receiver_removes_entry() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        let (tx, rx) = mpsc::channel(1);
        reg.insert(sid, "t".to_string(), None, Sink::Channel(tx));
        drop(rx);

        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Ignored));
        assert!(!reg.contains(sid));
    }

    #[tokio::test]
    async fn test_max_deliveries_auto_removes() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        let (tx, mut rx) = mpsc::channel(8);
        reg.insert(sid, "t".to_string(), None, Sink::Channel(tx));

        // One delivery already made, cap total at 3: two more to go
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Delivered));
        assert_eq!(reg.set_max(sid, 3), Some(2));
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Delivered));
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Delivered));
        assert!(!reg.contains(sid));
        assert!(matches!(reg.dispatch(msg(sid)), Delivery::Ignored));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_set_max_already_met_removes() {
        let mut reg = SubscriptionRegistry::new();
        let sid = 1;
        let (tx, _rx) = mpsc::channel(8);
        reg.insert(sid, "t".to_string(), None, Sink::Channel(tx));
        let m = msg(sid);
        let _ = reg.dispatch(m);
        assert_eq!(reg.set_max(sid, 1), Some(0));
        assert!(!reg.contains(sid));
    }

    #[test]
    fn test_resubscribe_frames_in_sid_order() {
        let mut reg = SubscriptionRegistry::new();
        let a = 1;
        let b = 2;
        let (tx, _rx) = mpsc::channel(1);
        reg.insert(b, "second".to_string(), Some("q".to_string()), Sink::Request);
        reg.insert(a, "first".to_string(), None, Sink::Channel(tx));

        let frames: Vec<String> = reg
            .resubscribe_frames()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        assert_eq!(frames[0], format!("SUB first {}\r\n", a));
        assert_eq!(frames[1], format!("SUB second q {}\r\n", b));
    }
}

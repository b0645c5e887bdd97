//! Ordered consumer
//!
//! An ephemeral push consumer that guarantees gapless, in-order delivery
//! without acks. Sequence gaps, missed heartbeats, and heartbeat/state
//! mismatches all trigger the same recovery: the consumer is recreated
//! server-side starting at the stream sequence after the last message the
//! caller actually saw, so no message is skipped or observed twice.

use std::time::Duration;

use bytes::Bytes;

use crate::connection::Event;
use crate::error::Result;
use crate::jetstream::context::JetStream;
use crate::jetstream::message::JsMsg;
use crate::jetstream::push::STALL_TOLERANCE;
use crate::jetstream::types::{AckPolicy, ConsumerConfig, DeliverPolicy};
use crate::protocol::headers::{HDR_LAST_CONSUMER, STATUS_CONTROL};
use crate::subscription::Subscriber;

const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);
const INACTIVE_THRESHOLD: Duration = Duration::from_secs(30);

/// Tracks the last accepted delivery; decides accept vs. reset
///
/// Consumer sequences restart at 1 whenever the consumer is recreated;
/// stream sequences are the durable position used to restart.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    consumer_seq: u64,
    stream_seq: u64,
}

impl SequenceTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept the delivery if it is exactly the next consumer sequence
    pub(crate) fn observe(&mut self, consumer_seq: u64, stream_seq: u64) -> bool {
        if consumer_seq == self.consumer_seq + 1 {
            self.consumer_seq = consumer_seq;
            self.stream_seq = stream_seq;
            true
        } else {
            false
        }
    }

    /// Last consumer sequence accepted on the current incarnation
    pub(crate) fn consumer_seq(&self) -> u64 {
        self.consumer_seq
    }

    /// Stream sequence the next incarnation must start from
    pub(crate) fn restart_from(&self) -> u64 {
        self.stream_seq + 1
    }

    /// Pin the stream position without having observed a delivery
    ///
    /// Used when the starting position is known at creation, so a restart
    /// before the first message cannot slide the window forward.
    pub(crate) fn seed(&mut self, stream_seq: u64) {
        self.stream_seq = stream_seq;
    }

    /// Whether any message has been accepted yet
    pub(crate) fn started(&self) -> bool {
        self.stream_seq > 0
    }

    /// A new incarnation restarts consumer numbering at 1
    pub(crate) fn reset_incarnation(&mut self) {
        self.consumer_seq = 0;
    }
}

/// An ephemeral, self-healing, strictly ordered stream consumer
#[derive(Debug)]
pub struct OrderedConsumer {
    js: JetStream,
    stream: String,
    base_config: ConsumerConfig,
    subscriber: Subscriber,
    deliver_subject: String,
    consumer_name: String,
    tracker: SequenceTracker,
    idle_heartbeat: Duration,
    initial_pending: u64,
}

impl OrderedConsumer {
    /// Create the first incarnation
    ///
    /// Delivery and filter fields of `base_config` are honored; ack policy,
    /// flow control, heartbeats, and storage are forced to the ordered
    /// profile.
    pub(crate) async fn create(
        js: JetStream,
        stream: String,
        mut base_config: ConsumerConfig,
    ) -> Result<Self> {
        base_config.durable_name = None;
        base_config.ack_policy = AckPolicy::None;
        base_config.max_deliver = 1;
        base_config.flow_control = true;
        base_config.idle_heartbeat = Some(IDLE_HEARTBEAT);
        base_config.inactive_threshold = Some(INACTIVE_THRESHOLD);
        base_config.mem_storage = true;
        base_config.num_replicas = 1;

        let deliver_subject = js.client().new_inbox();
        let subscriber = js.client().subscribe(deliver_subject.clone()).await?;

        let mut config = base_config.clone();
        config.deliver_subject = Some(deliver_subject.clone());
        let info = js.create_consumer(&stream, config).await?;

        let mut tracker = SequenceTracker::new();
        if base_config.deliver_policy == DeliverPolicy::New {
            // A new-only consumer starts at the stream's current tail; pin
            // it so a recreation before the first delivery resumes there
            // instead of re-anchoring to a later tail
            tracker.seed(info.delivered.stream_seq);
        }

        Ok(Self {
            js,
            stream,
            base_config,
            subscriber,
            deliver_subject,
            consumer_name: info.name.clone(),
            tracker,
            idle_heartbeat: IDLE_HEARTBEAT,
            initial_pending: info.num_pending,
        })
    }

    /// Messages the first incarnation had pending at creation
    ///
    /// Zero means the matched subjects were empty at that moment.
    pub fn initial_pending(&self) -> u64 {
        self.initial_pending
    }

    /// Receive the next message, in strict stream order
    ///
    /// Never yields a gap or a duplicate: any irregularity is repaired by
    /// recreating the consumer before the next message is returned.
    pub async fn next(&mut self) -> Result<Option<JsMsg>> {
        loop {
            let msg = match tokio::time::timeout(
                self.idle_heartbeat * STALL_TOLERANCE,
                self.subscriber.next(),
            )
            .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(None),
                Err(_) => {
                    tracing::warn!(
                        stream = %self.stream,
                        consumer = %self.consumer_name,
                        "heartbeats stopped, recreating ordered consumer"
                    );
                    self.js.client().emit_event(Event::ConsumerStalled {
                        deliver_subject: self.deliver_subject.clone(),
                    });
                    self.recreate().await?;
                    continue;
                }
            };

            if msg.is_status(STATUS_CONTROL) {
                // Flow control wants an echo before the server continues
                if let Some(reply) = &msg.reply {
                    self.js.client().publish(reply.clone(), Bytes::new()).await?;
                }
                // Heartbeats advertise the last consumer sequence sent;
                // a mismatch means deliveries were lost in flight
                if let Some(last) = msg
                    .headers
                    .as_ref()
                    .and_then(|h| h.get(HDR_LAST_CONSUMER))
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    if last != self.tracker.consumer_seq() {
                        tracing::warn!(
                            advertised = last,
                            seen = self.tracker.consumer_seq(),
                            "heartbeat disagrees with delivered state"
                        );
                        self.recreate().await?;
                    }
                }
                continue;
            }
            if msg.status.is_some() {
                continue;
            }

            let js_msg = match JsMsg::from_message(msg, self.js.client().clone()) {
                Ok(js_msg) => js_msg,
                Err(e) => {
                    tracing::warn!(error = %e, "delivery without ack metadata, skipping");
                    continue;
                }
            };
            let info = js_msg.info();
            if self
                .tracker
                .observe(info.consumer_sequence, info.stream_sequence)
            {
                return Ok(Some(js_msg));
            }
            tracing::warn!(
                expected = self.tracker.consumer_seq() + 1,
                got = info.consumer_sequence,
                "sequence gap, recreating ordered consumer"
            );
            self.recreate().await?;
        }
    }

    /// Replace the server-side consumer, resuming after the last message
    /// the caller saw
    async fn recreate(&mut self) -> Result<()> {
        let _ = self.subscriber.unsubscribe().await;

        self.deliver_subject = self.js.client().new_inbox();
        self.subscriber = self.js.client().subscribe(self.deliver_subject.clone()).await?;
        self.tracker.reset_incarnation();

        let mut config = self.base_config.clone();
        config.deliver_subject = Some(self.deliver_subject.clone());
        if self.tracker.started() {
            config.deliver_policy = DeliverPolicy::ByStartSequence;
            config.opt_start_seq = Some(self.tracker.restart_from());
        }
        let info = self.js.create_consumer(&self.stream, config).await?;
        self.consumer_name = info.name;
        Ok(())
    }

    /// Stop deliveries and delete the server-side consumer
    pub async fn stop(&mut self) -> Result<()> {
        self.subscriber.unsubscribe().await?;
        if !self.consumer_name.is_empty() {
            let _ = self
                .js
                .delete_consumer(&self.stream, &self.consumer_name)
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::jetstream::testing::{self, Inbound, Outgoing};

    type CreateLog = Arc<Mutex<Vec<serde_json::Value>>>;

    fn consumer_info(name: &str, delivered_stream_seq: u64) -> serde_json::Value {
        serde_json::json!({
            "stream_name": "EVENTS",
            "name": name,
            "delivered": { "consumer_seq": 0, "stream_seq": delivered_stream_seq },
        })
    }

    #[tokio::test]
    async fn test_gap_triggers_recreate_resuming_after_last_seen() {
        let creates: CreateLog = Arc::new(Mutex::new(Vec::new()));
        let handler: testing::Handler = {
            let creates = Arc::clone(&creates);
            Arc::new(move |inbound: &Inbound| {
                if inbound.subject != "$JS.API.CONSUMER.CREATE.EVENTS" {
                    return Vec::new();
                }
                let reply = inbound.reply.as_deref().unwrap();
                let body = inbound.json();
                let inbox = body["config"]["deliver_subject"].as_str().unwrap().to_string();
                let mut creates = creates.lock().unwrap();
                creates.push(body.clone());
                let name = format!("oc-{}", creates.len());
                let mut out = vec![Outgoing::json(reply, consumer_info(&name, 0))];
                if creates.len() == 1 {
                    // Two in-order deliveries, then consumer seq 4: a gap
                    out.push(Outgoing::delivery(
                        &inbox,
                        "events.a",
                        "$JS.ACK.EVENTS.oc-1.1.10.1.1700000000000000000.2",
                        b"a",
                    ));
                    out.push(Outgoing::delivery(
                        &inbox,
                        "events.b",
                        "$JS.ACK.EVENTS.oc-1.1.11.2.1700000000000000000.1",
                        b"b",
                    ));
                    out.push(Outgoing::delivery(
                        &inbox,
                        "events.d",
                        "$JS.ACK.EVENTS.oc-1.1.13.4.1700000000000000000.0",
                        b"d",
                    ));
                } else {
                    out.push(Outgoing::delivery(
                        &inbox,
                        "events.c",
                        "$JS.ACK.EVENTS.oc-2.1.12.1.1700000000000000000.1",
                        b"c",
                    ));
                }
                out
            })
        };
        let url = testing::start(handler).await;
        let client = crate::connect(url).await.unwrap();
        let mut consumer = client
            .jetstream()
            .ordered_consumer("EVENTS", ConsumerConfig::default())
            .await
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..3 {
            let msg = consumer.next().await.unwrap().unwrap();
            got.push(String::from_utf8(msg.payload().to_vec()).unwrap());
        }
        // The gap delivery never reached the caller; recreation resumed
        // at the sequence after the last accepted message
        assert_eq!(got, ["a", "b", "c"]);

        let creates = creates.lock().unwrap();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[1]["config"]["deliver_policy"], "by_start_sequence");
        assert_eq!(creates[1]["config"]["opt_start_seq"], 12);
    }

    #[tokio::test]
    async fn test_new_policy_recreate_resumes_from_creation_tail() {
        let creates: CreateLog = Arc::new(Mutex::new(Vec::new()));
        let handler: testing::Handler = {
            let creates = Arc::clone(&creates);
            Arc::new(move |inbound: &Inbound| {
                if inbound.subject != "$JS.API.CONSUMER.CREATE.EVENTS" {
                    return Vec::new();
                }
                let reply = inbound.reply.as_deref().unwrap();
                let body = inbound.json();
                let inbox = body["config"]["deliver_subject"].as_str().unwrap().to_string();
                let mut creates = creates.lock().unwrap();
                creates.push(body.clone());
                if creates.len() == 1 {
                    // Stream tail was 42 at creation; the heartbeat claims
                    // deliveries we never saw, forcing a recreation
                    vec![
                        Outgoing::json(reply, consumer_info("oc-1", 42)),
                        Outgoing::with_headers(
                            &inbox,
                            "NATS/1.0 100 Idle Heartbeat\r\nNats-Last-Consumer: 5\r\n\r\n",
                            b"",
                        ),
                    ]
                } else {
                    vec![
                        Outgoing::json(reply, consumer_info("oc-2", 42)),
                        Outgoing::delivery(
                            &inbox,
                            "events.x",
                            "$JS.ACK.EVENTS.oc-2.1.43.1.1700000000000000000.0",
                            b"x",
                        ),
                    ]
                }
            })
        };
        let url = testing::start(handler).await;
        let client = crate::connect(url).await.unwrap();
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::New,
            ..Default::default()
        };
        let mut consumer = client
            .jetstream()
            .ordered_consumer("EVENTS", config)
            .await
            .unwrap();

        let msg = consumer.next().await.unwrap().unwrap();
        assert_eq!(&msg.payload()[..], b"x");

        // The recreation pinned itself to the tail recorded at creation,
        // not to a fresh new-only position
        let creates = creates.lock().unwrap();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[1]["config"]["deliver_policy"], "by_start_sequence");
        assert_eq!(creates[1]["config"]["opt_start_seq"], 43);
    }

    #[test]
    fn test_tracker_accepts_in_order() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.observe(1, 10));
        assert!(tracker.observe(2, 11));
        assert!(tracker.observe(3, 15));
        assert_eq!(tracker.restart_from(), 16);
    }

    #[test]
    fn test_tracker_rejects_gap_and_duplicate() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.observe(1, 10));
        // Gap: consumer seq 3 with 2 never seen
        assert!(!tracker.observe(3, 12));
        // Duplicate of the last accepted
        assert!(!tracker.observe(1, 10));
        // Position unchanged by rejected observations
        assert_eq!(tracker.restart_from(), 11);
    }

    #[test]
    fn test_tracker_incarnation_reset() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.observe(1, 10));
        assert!(tracker.observe(2, 20));
        tracker.reset_incarnation();
        // New incarnation starts numbering at 1; stream position survives
        assert!(tracker.observe(1, 21));
        assert_eq!(tracker.restart_from(), 22);
    }

    #[test]
    fn test_tracker_seed_pins_restart_before_first_delivery() {
        let mut tracker = SequenceTracker::new();
        tracker.seed(42);
        assert!(tracker.started());
        // A restart before any delivery resumes right after the seed
        assert_eq!(tracker.restart_from(), 43);
        // Deliveries then advance the position as usual
        assert!(tracker.observe(1, 43));
        assert_eq!(tracker.restart_from(), 44);
    }

    #[test]
    fn test_tracker_started() {
        let mut tracker = SequenceTracker::new();
        assert!(!tracker.started());
        tracker.observe(1, 1);
        assert!(tracker.started());
    }
}

//! Connection status events
//!
//! A broadcast stream of typed lifecycle and advisory events. Events are
//! live-only: receivers that subscribe late or lag simply miss older
//! entries.

use tokio::sync::broadcast;

/// Typed status event emitted by the connection driver and consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Initial handshake succeeded
    Connected,
    /// Transport lost; reconnect loop starting
    Disconnected,
    /// Handshake succeeded after a disconnect
    Reconnected {
        /// `host:port` of the server we landed on
        server: String,
    },
    /// Cluster gossip announced new peer URLs
    ServersDiscovered(Vec<String>),
    /// The current server is shutting down gracefully
    LameDuckMode,
    /// A local subscription could not keep up and dropped messages
    SlowConsumer {
        /// Subscription identifier
        sid: u64,
        /// Subject of the subscription
        subject: String,
    },
    /// The server denied a publish or subscribe for one subject
    PermissionsViolation {
        /// "Publish" or "Subscription"
        operation: String,
        /// Offending subject
        subject: String,
    },
    /// A push consumer missed its idle heartbeats
    ConsumerStalled {
        /// Delivery subject of the stalled consumer
        deliver_subject: String,
    },
    /// Any other asynchronous server error
    Error(String),
    /// The connection reached its terminal state
    Closed,
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out for [`Event`]
#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Deliver to all current receivers; a send with no receivers is fine
    pub(crate) fn emit(&self, event: Event) {
        tracing::debug!(event = ?event, "status event");
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

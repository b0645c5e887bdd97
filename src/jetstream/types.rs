//! Persistent-stream API types
//!
//! Serde mirrors of the JSON bodies exchanged with the stream engine's
//! request/reply API. Durations travel as integer nanoseconds; unknown
//! fields from newer servers are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Serialize `Option<Duration>` as integer nanoseconds
pub(crate) mod serde_opt_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_u64(d.as_nanos() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos = Option::<u64>::deserialize(deserializer)?;
        Ok(nanos.and_then(|n| (n > 0).then(|| Duration::from_nanos(n))))
    }
}

/// Where delivery starts when a consumer is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first message still in the stream
    #[default]
    All,
    /// From the last message
    Last,
    /// Only messages published after creation
    New,
    /// From `opt_start_seq`
    ByStartSequence,
    /// From `opt_start_time`
    ByStartTime,
    /// The last message for each matching subject
    LastPerSubject,
}

/// How deliveries must be acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// No acknowledgement; delivery is fire-and-forget
    None,
    /// Acking one message acks everything before it
    All,
    /// Every message is acked individually
    #[default]
    Explicit,
}

/// Redelivery pacing for replayed history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// As fast as the consumer accepts
    #[default]
    Instant,
    /// At the original publish pacing
    Original,
}

/// Consumer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Names a durable consumer; absent for ephemerals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Push delivery subject; absent for pull consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    /// Starting stream sequence for `ByStartSequence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// Redelivery deadline for unacked messages
    #[serde(default, with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<Duration>,
    /// Redelivery attempts before a message is dropped; 0 means unlimited
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_deliver: i64,
    /// Restrict delivery to one subject (wildcards allowed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Idle heartbeat interval for push consumers
    #[serde(default, with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<Duration>,
    /// Server-paced flow control for push consumers
    #[serde(default, skip_serializing_if = "is_false")]
    pub flow_control: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_ack_pending: i64,
    /// Waiting pull requests the server will park
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_waiting: i64,
    /// Server deletes an ephemeral consumer idle this long
    #[serde(default, with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub inactive_threshold: Option<Duration>,
    /// Deliver headers only, with a Nats-Msg-Size header in place of bodies
    #[serde(default, skip_serializing_if = "is_false")]
    pub headers_only: bool,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub num_replicas: usize,
    /// Keep consumer state in memory only
    #[serde(default, skip_serializing_if = "is_false")]
    pub mem_storage: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

/// Paired consumer/stream positions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

/// Server-side view of one consumer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerInfo {
    #[serde(default)]
    pub stream_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: ConsumerConfig,
    /// Highest delivered positions
    #[serde(default)]
    pub delivered: SequenceInfo,
    /// Highest contiguously acknowledged positions
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    #[serde(default)]
    pub num_ack_pending: usize,
    #[serde(default)]
    pub num_redelivered: usize,
    #[serde(default)]
    pub num_waiting: usize,
    /// Messages in the stream not yet delivered to this consumer
    #[serde(default)]
    pub num_pending: u64,
}

/// How messages leave a full stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Age/size limits only
    #[default]
    Limits,
    /// Deleted once every bound consumer has acked
    Interest,
    /// Deleted once any consumer has acked
    WorkQueue,
}

/// Backing storage for a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Stream configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Message count ceiling; -1 means unlimited
    #[serde(default, rename = "max_msgs", skip_serializing_if = "is_zero_i64")]
    pub max_messages: i64,
    /// Per-subject message ceiling; backs key-value history depth
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_msgs_per_subject: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_bytes: i64,
    /// Message age ceiling
    #[serde(default, with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub max_msg_size: i32,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub num_replicas: usize,
    /// Permit rollup headers that replace a subject's history
    #[serde(default, rename = "allow_rollup_hdrs", skip_serializing_if = "is_false")]
    pub allow_rollup: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deny_delete: bool,
    /// Serve reads through the direct-get API
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_direct: bool,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Counters describing a stream's contents
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: usize,
}

/// Server-side view of one stream
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub config: StreamConfig,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub state: StreamState,
}

/// Acknowledgement for a stream publish
#[derive(Debug, Clone, Deserialize)]
pub struct PubAck {
    /// Stream that stored the message
    pub stream: String,
    /// Sequence assigned to the message
    #[serde(default, rename = "seq")]
    pub sequence: u64,
    /// Message was dropped as a duplicate
    #[serde(default)]
    pub duplicate: bool,
}

/// Body of a pull (`MSG.NEXT`) request
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct PullRequest {
    pub batch: usize,
    /// Server-side deadline after which the request is answered with a
    /// status message
    #[serde(with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub expires: Option<Duration>,
    /// Answer immediately with whatever is available
    #[serde(skip_serializing_if = "is_false")]
    pub no_wait: bool,
    #[serde(with = "serde_opt_nanos", skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<Duration>,
}

/// API reply envelope: either the expected body or an error
///
/// `Err` is listed first so an error envelope never deserializes into a
/// body type whose fields all have defaults.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Response<T> {
    Err { error: ApiError },
    Ok(T),
}

/// Reply to stream/consumer deletion
#[derive(Debug, Deserialize)]
pub(crate) struct DeleteResponse {
    #[serde(default)]
    pub success: bool,
}

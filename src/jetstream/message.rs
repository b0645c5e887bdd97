//! Stream message handle
//!
//! Wraps a delivered message together with the metadata encoded in its ack
//! reply subject, and provides the acknowledgement verbs. Acks are
//! idempotent per handle: after a terminal ack the rest become no-ops.

use std::time::Duration;

use bytes::Bytes;

use crate::connection::Client;
use crate::error::{ConsumerError, Error, Result};
use crate::protocol::{HeaderMap, Message};

const ACK: &[u8] = b"+ACK";
const NAK: &[u8] = b"-NAK";
const IN_PROGRESS: &[u8] = b"+WPI";
const TERM: &[u8] = b"+TERM";

/// Metadata carried in an ack reply subject
///
/// v1 shape: `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
/// v2 adds `<domain>.<account hash>` after `ACK` and may append extra tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream domain (v2 replies only)
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// Delivery attempt count, starting at 1
    pub delivered: u64,
    /// Sequence in the stream
    pub stream_sequence: u64,
    /// Sequence for this consumer
    pub consumer_sequence: u64,
    /// Publish timestamp in nanoseconds since the epoch
    pub timestamp: i64,
    /// Messages left in the stream for this consumer after this one
    pub pending: u64,
}

/// Parse the `$JS.ACK` reply subject attached to stream deliveries
pub(crate) fn parse_ack_reply(reply: &str) -> Result<DeliveryInfo> {
    let tokens: Vec<&str> = reply.split('.').collect();
    let bad = || Error::Consumer(ConsumerError::NotAckable);

    if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
        return Err(bad());
    }

    // v1 has exactly 9 tokens; anything longer is the v2 shape with
    // domain and account hash in positions 2 and 3
    let (domain, base) = if tokens.len() == 9 {
        (None, 2)
    } else if tokens.len() >= 11 {
        let domain = match tokens[2] {
            "_" => None,
            d => Some(d.to_string()),
        };
        (domain, 4)
    } else {
        return Err(bad());
    };

    let num = |s: &str| s.parse::<u64>().map_err(|_| bad());
    Ok(DeliveryInfo {
        domain,
        stream: tokens[base].to_string(),
        consumer: tokens[base + 1].to_string(),
        delivered: num(tokens[base + 2])?,
        stream_sequence: num(tokens[base + 3])?,
        consumer_sequence: num(tokens[base + 4])?,
        timestamp: tokens[base + 5].parse().map_err(|_| bad())?,
        pending: num(tokens[base + 6])?,
    })
}

/// One message delivered from a stream
#[derive(Debug)]
pub struct JsMsg {
    message: Message,
    client: Client,
    info: DeliveryInfo,
    reply: String,
    acked: bool,
}

impl JsMsg {
    /// Build from a raw delivery; fails when the reply subject is not an
    /// ack subject
    pub(crate) fn from_message(message: Message, client: Client) -> Result<Self> {
        let reply = message
            .reply
            .clone()
            .ok_or(Error::Consumer(ConsumerError::NotAckable))?;
        let info = parse_ack_reply(&reply)?;
        Ok(Self {
            message,
            client,
            info,
            reply,
            acked: false,
        })
    }

    /// Subject the message was published to
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    /// Message payload
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Message headers, if any
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    /// Stream metadata for this delivery
    pub fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    /// Unwrap the raw message
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Acknowledge successful processing
    pub async fn ack(&mut self) -> Result<()> {
        self.send_ack(ACK).await
    }

    /// Acknowledge and wait for the server to confirm it recorded the ack
    pub async fn double_ack(&mut self) -> Result<()> {
        if self.acked {
            return Ok(());
        }
        match self
            .client
            .request(self.reply.clone(), Bytes::from_static(ACK))
            .await
        {
            Ok(_) => {
                self.acked = true;
                Ok(())
            }
            Err(Error::Request(_)) => Err(Error::Consumer(ConsumerError::AckTimeout)),
            Err(e) => Err(e),
        }
    }

    /// Request redelivery, optionally after a delay
    pub async fn nak(&mut self, delay: Option<Duration>) -> Result<()> {
        match delay {
            None => self.send_ack(NAK).await,
            Some(delay) => {
                let body = format!("-NAK {{\"delay\": {}}}", delay.as_nanos());
                self.send_ack_bytes(Bytes::from(body)).await
            }
        }
    }

    /// Reset the redelivery clock without acknowledging
    ///
    /// Does not mark the message acked; a later [`JsMsg::ack`] still applies.
    pub async fn in_progress(&self) -> Result<()> {
        if self.acked {
            return Ok(());
        }
        self.client
            .publish(self.reply.clone(), Bytes::from_static(IN_PROGRESS))
            .await
    }

    /// Tell the server to never redeliver this message
    pub async fn term(&mut self) -> Result<()> {
        self.send_ack(TERM).await
    }

    async fn send_ack(&mut self, token: &'static [u8]) -> Result<()> {
        self.send_ack_bytes(Bytes::from_static(token)).await
    }

    async fn send_ack_bytes(&mut self, body: Bytes) -> Result<()> {
        if self.acked {
            return Ok(());
        }
        self.client.publish(self.reply.clone(), body).await?;
        self.acked = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_reply() {
        let info = parse_ack_reply("$JS.ACK.orders.workers.1.100.42.1700000000000000000.7")
            .unwrap();
        assert!(info.domain.is_none());
        assert_eq!(info.stream, "orders");
        assert_eq!(info.consumer, "workers");
        assert_eq!(info.delivered, 1);
        assert_eq!(info.stream_sequence, 100);
        assert_eq!(info.consumer_sequence, 42);
        assert_eq!(info.pending, 7);
    }

    #[test]
    fn test_parse_v2_reply_with_domain() {
        let info = parse_ack_reply("$JS.ACK.hub.acchash.orders.workers.2.100.42.1700000000000000000.0.rand")
            .unwrap();
        assert_eq!(info.domain.as_deref(), Some("hub"));
        assert_eq!(info.stream, "orders");
        assert_eq!(info.delivered, 2);
    }

    #[test]
    fn test_parse_v2_reply_without_domain() {
        let info = parse_ack_reply("$JS.ACK._.acchash.orders.workers.1.5.5.1700000000000000000.0.x")
            .unwrap();
        assert!(info.domain.is_none());
        assert_eq!(info.stream_sequence, 5);
    }

    #[test]
    fn test_parse_rejects_non_ack_subjects() {
        assert!(parse_ack_reply("_INBOX.abc.1").is_err());
        assert!(parse_ack_reply("$JS.ACK.too.short").is_err());
        assert!(parse_ack_reply("$JS.ACK.s.c.x.1.2.3.4").is_err());
        // 10 tokens is neither v1 nor v2
        assert!(parse_ack_reply("$JS.ACK.a.b.1.2.3.4.5.6").is_err());
    }
}

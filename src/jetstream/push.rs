//! Push consumer
//!
//! The server pushes deliveries to a subject we subscribe to. Control
//! traffic (idle heartbeats, flow control) is handled inline so callers
//! only ever see data messages.

use std::time::Duration;

use bytes::Bytes;

use crate::connection::Event;
use crate::error::Result;
use crate::jetstream::context::JetStream;
use crate::jetstream::message::JsMsg;
use crate::jetstream::types::ConsumerInfo;
use crate::protocol::headers::STATUS_CONTROL;
use crate::subscription::Subscriber;

/// Missed heartbeats tolerated before the consumer is considered stalled
pub(crate) const STALL_TOLERANCE: u32 = 2;

/// A push-mode stream consumer
#[derive(Debug)]
pub struct PushConsumer {
    js: JetStream,
    subscriber: Subscriber,
    info: ConsumerInfo,
    deliver_subject: String,
    idle_heartbeat: Option<Duration>,
}

impl PushConsumer {
    pub(crate) fn new(
        js: JetStream,
        subscriber: Subscriber,
        info: ConsumerInfo,
        deliver_subject: String,
    ) -> Self {
        let idle_heartbeat = info.config.idle_heartbeat;
        Self {
            js,
            subscriber,
            info,
            deliver_subject,
            idle_heartbeat,
        }
    }

    /// Consumer state as of creation
    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Receive the next data message
    ///
    /// Returns `None` once the underlying subscription ends. When idle
    /// heartbeats are configured and none arrive within the tolerance, a
    /// [`Event::ConsumerStalled`] advisory is emitted and the wait
    /// continues.
    pub async fn next(&mut self) -> Result<Option<JsMsg>> {
        loop {
            let msg = match self.idle_heartbeat {
                Some(heartbeat) => {
                    match tokio::time::timeout(
                        heartbeat * STALL_TOLERANCE,
                        self.subscriber.next(),
                    )
                    .await
                    {
                        Ok(msg) => msg,
                        Err(_) => {
                            tracing::warn!(
                                deliver_subject = %self.deliver_subject,
                                "no heartbeat from consumer"
                            );
                            self.js.client().emit_event(Event::ConsumerStalled {
                                deliver_subject: self.deliver_subject.clone(),
                            });
                            continue;
                        }
                    }
                }
                None => self.subscriber.next().await,
            };
            let Some(msg) = msg else {
                return Ok(None);
            };

            if msg.is_status(STATUS_CONTROL) {
                // Flow control frames carry a reply subject the server
                // waits on before sending more
                if let Some(reply) = msg.reply {
                    self.js.client().publish(reply, Bytes::new()).await?;
                }
                continue;
            }
            if msg.status.is_some() {
                tracing::debug!(status = ?msg.status, "ignoring status message");
                continue;
            }

            match JsMsg::from_message(msg, self.js.client().clone()) {
                Ok(js_msg) => return Ok(Some(js_msg)),
                Err(e) => {
                    tracing::warn!(error = %e, "delivery without ack metadata, skipping");
                }
            }
        }
    }

    /// Stop deliveries and delete the consumer if it is ephemeral
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.subscriber.unsubscribe().await?;
        if self.info.config.durable_name.is_none() && !self.info.name.is_empty() {
            let _ = self
                .js
                .delete_consumer(&self.info.stream_name, &self.info.name)
                .await;
        }
        Ok(())
    }
}

//! Pull consumer
//!
//! The client asks for messages explicitly with `MSG.NEXT` requests; the
//! server answers on our inbox with data messages, then a status message
//! when a request expires or runs dry. Pulls are additive: several may be
//! outstanding, bounded by a ceiling.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{ConsumerError, Error, Result};
use crate::jetstream::context::JetStream;
use crate::jetstream::message::JsMsg;
use crate::jetstream::types::{ConsumerInfo, PullRequest};
use crate::protocol::headers::{
    STATUS_CONFLICT, STATUS_CONTROL, STATUS_NO_MESSAGES, STATUS_REQUEST_TIMEOUT,
};
use crate::subscription::Subscriber;

/// Ceiling on concurrently outstanding pull requests
const MAX_OUTSTANDING_PULLS: usize = 128;

/// Extra client-side wait beyond a fetch's server-side expiry
const FETCH_GRACE: Duration = Duration::from_secs(1);

/// Options for one pull request
///
/// Defaults to a plain open-ended pull; chain the methods to bound it.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    expires: Option<Duration>,
    no_wait: bool,
    idle_heartbeat: Option<Duration>,
}

impl PullOptions {
    /// Options with nothing set
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-side deadline; the request is retired with a status message
    /// once it passes
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Answer immediately with whatever is available instead of waiting
    /// for the batch to fill
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Ask the server to send idle heartbeats while the request waits
    pub fn idle_heartbeat(mut self, interval: Duration) -> Self {
        self.idle_heartbeat = Some(interval);
        self
    }
}

/// A pull-mode stream consumer
#[derive(Debug)]
pub struct PullConsumer {
    js: JetStream,
    info: ConsumerInfo,
    subscriber: Subscriber,
    inbox: String,
    next_subject: String,
    outstanding: usize,
}

impl PullConsumer {
    pub(crate) async fn new(js: JetStream, info: ConsumerInfo) -> Result<Self> {
        let inbox = js.client().new_inbox();
        let subscriber = js.client().subscribe(inbox.clone()).await?;
        let next_subject =
            js.api_subject(&format!("CONSUMER.MSG.NEXT.{}.{}", info.stream_name, info.name));
        Ok(Self {
            js,
            info,
            subscriber,
            inbox,
            next_subject,
            outstanding: 0,
        })
    }

    /// Consumer state as of creation
    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Pull requests currently believed to be outstanding
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Ask the server for up to `batch` more messages
    ///
    /// Additive: the new request queues behind any outstanding ones. An
    /// unbounded pull waits server-side indefinitely; use
    /// [`PullConsumer::pull_with_options`] to attach an expiry or `no_wait`.
    pub async fn pull(&mut self, batch: usize) -> Result<()> {
        self.pull_with_options(batch, PullOptions::new()).await
    }

    /// Ask for up to `batch` more messages, bounded by `options`
    pub async fn pull_with_options(&mut self, batch: usize, options: PullOptions) -> Result<()> {
        if self.outstanding >= MAX_OUTSTANDING_PULLS {
            return Err(Error::Consumer(ConsumerError::OutstandingPulls {
                limit: MAX_OUTSTANDING_PULLS,
            }));
        }
        let request = PullRequest {
            batch,
            expires: options.expires,
            no_wait: options.no_wait,
            idle_heartbeat: options.idle_heartbeat,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| Error::Protocol(crate::error::ProtocolError::Parse(e.to_string())))?;
        self.js
            .client()
            .publish_with_reply(&self.next_subject, &self.inbox, Bytes::from(body))
            .await?;
        self.outstanding += 1;
        Ok(())
    }

    /// Receive the next message from any outstanding pull
    ///
    /// Returns `None` when the subscription ends. Status answers retiring
    /// an expired or empty request are consumed internally.
    pub async fn next(&mut self) -> Result<Option<JsMsg>> {
        loop {
            let Some(msg) = self.subscriber.next().await else {
                return Ok(None);
            };
            if let Some(status) = msg.status {
                self.note_status(status);
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

    /// Request one finite batch and iterate it to completion
    ///
    /// The returned handle ends after `batch` messages, a terminating
    /// status from the server, or the expiry (plus a grace period) passes.
    pub async fn fetch(&mut self, batch: usize, expires: Duration) -> Result<Fetch<'_>> {
        self.pull_with_options(batch, PullOptions::new().expires(expires))
            .await?;
        Ok(Fetch {
            deadline: Instant::now() + expires + FETCH_GRACE,
            remaining: batch,
            done: false,
            consumer: self,
        })
    }

    fn note_status(&mut self, status: u16) {
        match status {
            STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT | STATUS_CONFLICT => {
                // One request retired
                self.outstanding = self.outstanding.saturating_sub(1);
            }
            STATUS_CONTROL => {}
            other => {
                tracing::debug!(status = other, "unexpected status on pull inbox");
            }
        }
    }
}

/// Iterator over one fetched batch; ends when the batch is exhausted
#[derive(Debug)]
pub struct Fetch<'a> {
    consumer: &'a mut PullConsumer,
    deadline: Instant,
    remaining: usize,
    done: bool,
}

impl Fetch<'_> {
    /// Next message of the batch, or `None` once the batch is over
    pub async fn next(&mut self) -> Result<Option<JsMsg>> {
        if self.done || self.remaining == 0 {
            return Ok(None);
        }
        loop {
            let msg = match tokio::time::timeout_at(self.deadline, self.consumer.subscriber.next())
                .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => {
                    self.finish();
                    return Ok(None);
                }
            };
            if let Some(status) = msg.status {
                match status {
                    STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT | STATUS_CONFLICT => {
                        self.finish();
                        return Ok(None);
                    }
                    _ => continue,
                }
            }
            match JsMsg::from_message(msg, self.consumer.js.client().clone()) {
                Ok(js_msg) => {
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        self.finish();
                    }
                    return Ok(Some(js_msg));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "delivery without ack metadata, skipping");
                }
            }
        }
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.consumer.outstanding = self.consumer.outstanding.saturating_sub(1);
        }
    }
}

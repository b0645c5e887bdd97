//! Watches and history replays
//!
//! Both ride an ordered consumer over the bucket's stream, so entries
//! arrive gapless and in revision order. A watch is endless; a history
//! replay finishes once the entry that had nothing pending behind it has
//! been yielded.

use crate::error::Result;
use crate::jetstream::OrderedConsumer;
use crate::kv::entry::Entry;

/// Endless stream of changes to matching keys
#[derive(Debug)]
pub struct Watch {
    consumer: OrderedConsumer,
    bucket: String,
    prefix: String,
}

impl Watch {
    pub(crate) fn new(consumer: OrderedConsumer, bucket: String, prefix: String) -> Self {
        Self {
            consumer,
            bucket,
            prefix,
        }
    }

    /// Next change; `None` only if the connection ends
    pub async fn next(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some(msg) = self.consumer.next().await? else {
                return Ok(None);
            };
            if let Some(entry) = Entry::from_delivery(&msg, &self.bucket, &self.prefix) {
                return Ok(Some(entry));
            }
            tracing::debug!(subject = %msg.subject(), "delivery outside bucket prefix");
        }
    }

    /// Stop watching and delete the backing consumer
    pub async fn stop(&mut self) -> Result<()> {
        self.consumer.stop().await
    }
}

/// Finite replay of stored revisions
///
/// Ends after the entry with nothing pending behind it; a bucket or key
/// with no stored revisions yields nothing at all.
#[derive(Debug)]
pub struct History {
    consumer: OrderedConsumer,
    bucket: String,
    prefix: String,
    done: bool,
}

impl History {
    pub(crate) fn new(consumer: OrderedConsumer, bucket: String, prefix: String) -> Self {
        // Nothing was pending at creation, so there is nothing to replay
        let done = consumer.initial_pending() == 0;
        Self {
            consumer,
            bucket,
            prefix,
            done,
        }
    }

    /// Next stored revision, oldest first; `None` once the replay is over
    pub async fn next(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(msg) = self.consumer.next().await? else {
                self.done = true;
                return Ok(None);
            };
            let Some(entry) = Entry::from_delivery(&msg, &self.bucket, &self.prefix) else {
                continue;
            };
            if entry.delta == 0 {
                self.done = true;
                let _ = self.consumer.stop().await;
            }
            return Ok(Some(entry));
        }
    }
}

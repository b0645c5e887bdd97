//! Subscriber handle
//!
//! The receiving end of one subscription. Messages arrive on a bounded
//! channel filled by the connection driver; dropping the handle (or calling
//! [`Subscriber::unsubscribe`]) tells the driver to stop deliveries.

use tokio::sync::mpsc;

use crate::connection::driver::Command;
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::Message;

/// One active subscription
#[derive(Debug)]
pub struct Subscriber {
    sid: u64,
    subject: String,
    rx: mpsc::Receiver<Message>,
    cmd_tx: mpsc::Sender<Command>,
    unsubscribed: bool,
}

impl Subscriber {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        rx: mpsc::Receiver<Message>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            sid,
            subject,
            rx,
            cmd_tx,
            unsubscribed: false,
        }
    }

    /// Subject this subscription listens on
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receive the next message
    ///
    /// Returns `None` once the subscription has ended: unsubscribed, the
    /// delivery cap was reached, or the connection closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive without waiting, if a message is already buffered
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Stop deliveries immediately
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.unsubscribed = true;
        self.cmd_tx
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))
    }

    /// Stop after `max` total deliveries, counting those already received
    ///
    /// Buffered messages up to the cap are still yielded by
    /// [`Subscriber::next`]; the stream then ends.
    pub async fn unsubscribe_after(&mut self, max: u64) -> Result<()> {
        self.unsubscribed = true;
        self.cmd_tx
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: Some(max),
            })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.unsubscribed {
            // Best effort: if the driver is gone the subscription is too
            let _ = self.cmd_tx.try_send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            });
        }
    }
}

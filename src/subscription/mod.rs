//! Subscription multiplexing
//!
//! One wire connection fans out to many subscriptions. The driver-owned
//! registry routes decoded messages by sid; `Subscriber` is the public
//! receiving handle; the inbox map multiplexes request/reply calls over a
//! single wildcard subscription.

mod handle;
pub(crate) mod inbox;
pub(crate) mod registry;

pub use handle::Subscriber;

//! Persistent streams
//!
//! Client-side engine for the server's stream layer: publish with storage
//! acks, manage streams and consumers through the JSON API, and consume
//! with push, pull, or strictly ordered semantics.

mod context;
mod message;
mod ordered;
mod pull;
mod push;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use context::JetStream;
pub use message::{DeliveryInfo, JsMsg};
pub use ordered::OrderedConsumer;
pub use pull::{Fetch, PullConsumer, PullOptions};
pub use push::PushConsumer;

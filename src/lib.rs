//! Async client for NATS-compatible pub/sub messaging
//!
//! Core messaging (publish, subscribe, request/reply) rides a single
//! multiplexed connection with automatic reconnection and resubscription.
//! The `jetstream` module adds persistent streams with at-least-once
//! consumers, and `kv` layers a revisioned key-value store on top.
//!
//! ```no_run
//! use bytes::Bytes;
//!
//! # async fn demo() -> courier::Result<()> {
//! let client = courier::connect("nats://localhost:4222").await?;
//! let mut sub = client.subscribe("orders.>").await?;
//! client.publish("orders.new", Bytes::from_static(b"order 42")).await?;
//! if let Some(msg) = sub.next().await {
//!     println!("{} -> {:?}", msg.subject, msg.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod jetstream;
pub mod kv;
pub mod protocol;
pub mod stats;
pub mod subscription;

pub use connection::{
    connect, connect_with_options, Authenticator, Client, ConnectOptions, ConnectionState,
    Credentials, Event, TokenAuth, UserPassAuth,
};
pub use error::{Error, Result};
pub use jetstream::JetStream;
pub use protocol::{HeaderMap, Message};
pub use stats::StatsSnapshot;
pub use subscription::Subscriber;

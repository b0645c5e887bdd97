//! Connection management
//!
//! The public entry points are [`connect`] and [`connect_with_options`];
//! they hand back a cloneable [`Client`] backed by a single driver task
//! that owns the transport, the reconnect loop, and all subscription
//! routing.

mod client;
pub mod config;
pub(crate) mod driver;
mod events;
mod servers;
mod state;

pub use client::{connect, connect_with_options, Client};
pub use config::{Authenticator, ConnectOptions, Credentials, TokenAuth, UserPassAuth};
pub use events::Event;
pub use state::ConnectionState;

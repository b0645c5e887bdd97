//! Key-value layer
//!
//! Buckets are persistent streams with per-subject history; keys map to
//! subjects under `$KV.<bucket>.`. Reads use the direct-get API, writes
//! use storage acks, and compare-and-set rides the expected-sequence
//! header.

mod entry;
mod store;
mod watch;

pub use entry::{Entry, Operation};
pub use store::{create_bucket, open_bucket, KvConfig, KvStatus, KvStore};
pub use watch::{History, Watch};

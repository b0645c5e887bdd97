//! Error types for the client
//!
//! One crate-level [`Error`] with per-area sub-enums: wire protocol faults,
//! connection lifecycle failures, server-reported errors, request/reply
//! failures, stream-consumer failures, and key-value precondition violations.

use std::fmt;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level client error
#[derive(Debug)]
pub enum Error {
    /// I/O error on the transport
    Io(io::Error),
    /// Malformed or unexpected wire data
    Protocol(ProtocolError),
    /// Error reported by the server over the wire (-ERR)
    Server(ServerError),
    /// Connection lifecycle failure
    Connection(ConnectionError),
    /// Request/reply failure scoped to a single call
    Request(RequestError),
    /// Stream consumer failure
    Consumer(ConsumerError),
    /// JetStream API error response
    Api(ApiError),
    /// Key-value precondition or usage violation
    Kv(KvError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Server(e) => write!(f, "server error: {}", e),
            Error::Connection(e) => write!(f, "connection error: {}", e),
            Error::Request(e) => write!(f, "request error: {}", e),
            Error::Consumer(e) => write!(f, "consumer error: {}", e),
            Error::Api(e) => write!(f, "api error: {}", e),
            Error::Kv(e) => write!(f, "kv error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<RequestError> for Error {
    fn from(err: RequestError) -> Self {
        Error::Request(err)
    }
}

impl From<ConsumerError> for Error {
    fn from(err: ConsumerError) -> Self {
        Error::Consumer(err)
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(err)
    }
}

impl From<KvError> for Error {
    fn from(err: KvError) -> Self {
        Error::Kv(err)
    }
}

/// Malformed or unexpected wire data
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame could not be parsed
    Parse(String),
    /// Payload exceeds the server's advertised maximum
    PayloadTooLarge {
        /// Attempted payload size in bytes
        size: usize,
        /// Server-advertised maximum
        max: usize,
    },
    /// Subject contains illegal characters or structure
    InvalidSubject(String),
    /// Header block could not be parsed
    BadHeaders(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Parse(msg) => write!(f, "cannot parse frame: {}", msg),
            ProtocolError::PayloadTooLarge { size, max } => {
                write!(f, "payload too large: {} > {}", size, max)
            }
            ProtocolError::InvalidSubject(s) => write!(f, "invalid subject: {}", s),
            ProtocolError::BadHeaders(msg) => write!(f, "cannot parse headers: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Error text reported by the server with -ERR, classified by severity
///
/// Authorization violations are fatal for the current transport.
/// Permissions violations are scoped to one subject and leave the
/// connection usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Credentials rejected for the whole connection
    AuthorizationViolation,
    /// A publish or subscribe was denied for one subject
    PermissionsViolation {
        /// "Publish" or "Subscription"
        operation: String,
        /// Subject the violation applies to
        subject: String,
    },
    /// The server dropped messages for a slow consumer
    SlowConsumer,
    /// The server considered the connection stale
    StaleConnection,
    /// Any other server-reported error
    Other(String),
}

impl ServerError {
    /// Classify a raw -ERR payload
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim().trim_matches('\'');
        let lower = trimmed.to_lowercase();

        if lower.starts_with("authorization violation") {
            return ServerError::AuthorizationViolation;
        }
        if lower.starts_with("permissions violation") {
            // "Permissions Violation for <operation> to <subject>"
            let mut operation = String::new();
            let mut subject = String::new();
            let words: Vec<&str> = trimmed.split_whitespace().collect();
            if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("for")) {
                if let Some(op) = words.get(pos + 1) {
                    operation = (*op).to_string();
                }
            }
            if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("to")) {
                if let Some(subj) = words.get(pos + 1) {
                    subject = subj.trim_matches('"').to_string();
                }
            }
            return ServerError::PermissionsViolation { operation, subject };
        }
        if lower.starts_with("slow consumer") {
            return ServerError::SlowConsumer;
        }
        if lower.starts_with("stale connection") {
            return ServerError::StaleConnection;
        }
        ServerError::Other(trimmed.to_string())
    }

    /// Whether this error terminates the current transport
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::AuthorizationViolation | ServerError::StaleConnection
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AuthorizationViolation => write!(f, "authorization violation"),
            ServerError::PermissionsViolation { operation, subject } => {
                write!(f, "permissions violation for {} to {}", operation, subject)
            }
            ServerError::SlowConsumer => write!(f, "slow consumer, messages dropped"),
            ServerError::StaleConnection => write!(f, "stale connection"),
            ServerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

/// Connection lifecycle failure
#[derive(Debug)]
pub enum ConnectionError {
    /// Connection has been closed
    Closed,
    /// Connection is draining; no new work accepted
    Draining,
    /// No active transport and the operation cannot be buffered
    NotConnected,
    /// Outbound buffer ceiling reached while disconnected
    ReconnectBufferExceeded {
        /// Configured ceiling in bytes
        limit: usize,
    },
    /// Every server in the pool was tried and failed
    AttemptsExhausted,
    /// The server rejected our credentials during handshake
    AuthenticationFailed(String),
    /// The server requires TLS, which this client does not provide
    TlsRequired,
    /// Server URL could not be parsed
    InvalidUrl(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::Draining => write!(f, "connection draining"),
            ConnectionError::NotConnected => write!(f, "not connected"),
            ConnectionError::ReconnectBufferExceeded { limit } => {
                write!(f, "reconnect buffer exceeded ({} bytes)", limit)
            }
            ConnectionError::AttemptsExhausted => write!(f, "all connect attempts failed"),
            ConnectionError::AuthenticationFailed(msg) => {
                write!(f, "authentication failed: {}", msg)
            }
            ConnectionError::TlsRequired => write!(f, "server requires TLS"),
            ConnectionError::InvalidUrl(url) => write!(f, "invalid server url: {}", url),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Request/reply failure scoped to a single call
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived within the configured timeout
    Timeout,
    /// The server signalled that nobody is listening on the subject
    NoResponders,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "request timed out"),
            RequestError::NoResponders => write!(f, "no responders for request"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Stream consumer failure
#[derive(Debug)]
pub enum ConsumerError {
    /// Consumer configuration is invalid for the requested mode
    InvalidConfig(String),
    /// Double-ack confirmation did not arrive in time
    AckTimeout,
    /// Message carried no ack reply subject
    NotAckable,
    /// More concurrent pull requests than the configured ceiling
    OutstandingPulls {
        /// Configured ceiling
        limit: usize,
    },
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::InvalidConfig(msg) => write!(f, "invalid consumer config: {}", msg),
            ConsumerError::AckTimeout => write!(f, "ack confirmation timed out"),
            ConsumerError::NotAckable => write!(f, "message has no ack reply subject"),
            ConsumerError::OutstandingPulls { limit } => {
                write!(f, "too many outstanding pull requests (limit {})", limit)
            }
        }
    }
}

impl std::error::Error for ConsumerError {}

/// Error envelope returned by the JetStream API
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ApiError {
    /// HTTP-like status code
    pub code: u16,
    /// Stable API error code
    #[serde(default)]
    pub err_code: u64,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, err_code {})",
            self.description, self.code, self.err_code
        )
    }
}

impl std::error::Error for ApiError {}

/// Key-value precondition or usage violation
#[derive(Debug)]
pub enum KvError {
    /// `create` on a key that already has a live value
    KeyExists {
        /// Offending key
        key: String,
    },
    /// `update` with a revision that is no longer current
    WrongRevision {
        /// Offending key
        key: String,
        /// Revision the caller expected
        expected: u64,
    },
    /// Key contains illegal characters or structure
    InvalidKey(String),
    /// Bucket name contains illegal characters
    InvalidBucket(String),
    /// Requested history depth outside the supported range
    InvalidHistory(i64),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::KeyExists { key } => write!(f, "key already exists: {}", key),
            KvError::WrongRevision { key, expected } => {
                write!(f, "wrong revision for {}: expected {}", key, expected)
            }
            KvError::InvalidKey(key) => write!(f, "invalid key: {}", key),
            KvError::InvalidBucket(bucket) => write!(f, "invalid bucket name: {}", bucket),
            KvError::InvalidHistory(depth) => {
                write!(f, "history depth {} outside 1..=64", depth)
            }
        }
    }
}

impl std::error::Error for KvError {}

//! Client configuration
//!
//! Builder-style options consumed by [`crate::connect_with_options`]. Every
//! method takes and returns `self` so options chain fluently; unset fields
//! keep the defaults below.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Default outbound buffer ceiling while disconnected (8 MiB)
pub const DEFAULT_RECONNECT_BUFFER: usize = 8 * 1024 * 1024;
/// Default per-subscription channel capacity
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 65_536;

/// Credentials resolved at handshake time
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Username for user/password auth
    pub user: Option<String>,
    /// Password for user/password auth
    pub pass: Option<String>,
    /// Token auth
    pub token: Option<String>,
    /// User JWT
    pub jwt: Option<String>,
    /// Public NKey
    pub nkey: Option<String>,
    /// Signature over the server nonce
    pub signature: Option<String>,
}

/// Supplies credentials for each handshake attempt
///
/// Called once per connect or reconnect with the server's nonce, so
/// implementations can produce fresh signatures or rotate tokens.
pub trait Authenticator: Send + Sync {
    /// Resolve credentials for one handshake
    fn credentials(&self, nonce: Option<&str>) -> Result<Credentials>;
}

/// Static user/password authenticator
#[derive(Debug, Clone)]
pub struct UserPassAuth {
    user: String,
    pass: String,
}

impl UserPassAuth {
    /// Create an authenticator from a fixed user and password
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

impl Authenticator for UserPassAuth {
    fn credentials(&self, _nonce: Option<&str>) -> Result<Credentials> {
        Ok(Credentials {
            user: Some(self.user.clone()),
            pass: Some(self.pass.clone()),
            ..Default::default()
        })
    }
}

/// Static token authenticator
#[derive(Debug, Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    /// Create an authenticator from a fixed token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for TokenAuth {
    fn credentials(&self, _nonce: Option<&str>) -> Result<Credentials> {
        Ok(Credentials {
            token: Some(self.token.clone()),
            ..Default::default()
        })
    }
}

/// Connection options
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) servers: Vec<String>,
    pub(crate) name: Option<String>,
    pub(crate) auth: Option<Arc<dyn Authenticator>>,
    pub(crate) no_randomize: bool,
    pub(crate) ignore_discovered_servers: bool,
    /// `None` means retry forever
    pub(crate) max_reconnects: Option<usize>,
    pub(crate) reconnect_delay: Duration,
    pub(crate) reconnect_buffer_size: usize,
    pub(crate) ping_interval: Duration,
    pub(crate) max_outstanding_pings: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) inbox_prefix: String,
    pub(crate) subscription_capacity: usize,
    pub(crate) echo: bool,
    pub(crate) connection_timeout: Duration,
    pub(crate) retry_on_initial_connect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            name: None,
            auth: None,
            no_randomize: false,
            ignore_discovered_servers: false,
            max_reconnects: None,
            reconnect_delay: Duration::from_secs(2),
            reconnect_buffer_size: DEFAULT_RECONNECT_BUFFER,
            ping_interval: Duration::from_secs(60),
            max_outstanding_pings: 2,
            request_timeout: Duration::from_secs(10),
            inbox_prefix: "_INBOX".to_string(),
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            echo: true,
            connection_timeout: Duration::from_secs(5),
            retry_on_initial_connect: false,
        }
    }
}

impl ConnectOptions {
    /// Options with all defaults and no servers; add at least one with
    /// [`ConnectOptions::server`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one server URL to the pool
    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    /// Replace the server pool wholesale
    pub fn servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Client name reported to the server
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Authenticator consulted on every handshake
    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Fixed user/password credentials
    pub fn user_and_password(self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.authenticator(Arc::new(UserPassAuth::new(user, pass)))
    }

    /// Fixed token credentials
    pub fn token(self, token: impl Into<String>) -> Self {
        self.authenticator(Arc::new(TokenAuth::new(token)))
    }

    /// Try servers in configuration order instead of shuffling
    pub fn no_randomize(mut self) -> Self {
        self.no_randomize = true;
        self
    }

    /// Never add gossip-discovered servers to the pool
    pub fn ignore_discovered_servers(mut self) -> Self {
        self.ignore_discovered_servers = true;
        self
    }

    /// Cap reconnect passes over the pool; `None` retries forever
    pub fn max_reconnects(mut self, max: Option<usize>) -> Self {
        self.max_reconnects = max;
        self
    }

    /// Base delay between reconnect passes (jitter is added on top)
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Ceiling in bytes for publishes buffered while disconnected
    pub fn reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.reconnect_buffer_size = bytes;
        self
    }

    /// Interval between client-initiated keep-alive probes
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Unanswered probes tolerated before the transport is declared dead
    pub fn max_outstanding_pings(mut self, max: usize) -> Self {
        self.max_outstanding_pings = max.max(1);
        self
    }

    /// Default deadline for request/reply calls
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Subject prefix for request/reply inboxes
    pub fn inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    /// Channel capacity for each subscription
    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity.max(1);
        self
    }

    /// Whether the server echoes this client's own publishes back to it
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Per-server dial and handshake deadline
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Keep retrying when the very first connect fails, instead of erroring
    pub fn retry_on_initial_connect(mut self) -> Self {
        self.retry_on_initial_connect = true;
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("auth", &self.auth.as_ref().map(|_| "<authenticator>"))
            .field("no_randomize", &self.no_randomize)
            .field("max_reconnects", &self.max_reconnects)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("reconnect_buffer_size", &self.reconnect_buffer_size)
            .field("ping_interval", &self.ping_interval)
            .field("max_outstanding_pings", &self.max_outstanding_pings)
            .field("request_timeout", &self.request_timeout)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("subscription_capacity", &self.subscription_capacity)
            .field("echo", &self.echo)
            .field("connection_timeout", &self.connection_timeout)
            .field("retry_on_initial_connect", &self.retry_on_initial_connect)
            .finish()
    }
}

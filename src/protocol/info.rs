//! Handshake JSON payloads
//!
//! `ServerInfo` is the cluster-advertised snapshot sent with every INFO
//! frame; `ConnectInfo` is what the client answers with. Both are plain
//! serde types; unknown fields are ignored so newer servers stay compatible.

use serde::{Deserialize, Serialize};

/// Server-advertised metadata, replaced wholesale on every handshake
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    /// Unique server identifier
    #[serde(default)]
    pub server_id: String,
    /// Human-readable server name
    #[serde(default)]
    pub server_name: String,
    /// Server version string
    #[serde(default)]
    pub version: String,
    /// Protocol level (1 enables async INFO and cluster gossip)
    #[serde(default)]
    pub proto: i32,
    /// Host the server listens on
    #[serde(default)]
    pub host: String,
    /// Port the server listens on
    #[serde(default)]
    pub port: u16,
    /// Maximum accepted payload in bytes
    #[serde(default)]
    pub max_payload: usize,
    /// Whether the server requires authentication
    #[serde(default)]
    pub auth_required: bool,
    /// Whether the server requires TLS
    #[serde(default)]
    pub tls_required: bool,
    /// Whether the server supports message headers
    #[serde(default)]
    pub headers: bool,
    /// Whether the persistent-stream engine is available
    #[serde(default)]
    pub jetstream: bool,
    /// Known peer URLs for cluster topology updates
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// Nonce to be signed by credential-based authenticators
    #[serde(default)]
    pub nonce: Option<String>,
    /// Lame duck mode: the server is shutting down gracefully
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
    /// Server-assigned client id
    #[serde(default)]
    pub client_id: u64,
}

/// Client options and credentials sent with CONNECT
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    /// Echo +OK for every operation
    pub verbose: bool,
    /// Strict subject checking
    pub pedantic: bool,
    /// Whether the client will upgrade to TLS
    pub tls_required: bool,
    /// Optional client name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Implementation language
    pub lang: String,
    /// Client library version
    pub version: String,
    /// Protocol level the client speaks
    pub protocol: i32,
    /// Whether the server should echo the client's own publishes back
    pub echo: bool,
    /// Username for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Token auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// User JWT (opaque to this client)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// Public NKey (opaque to this client)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    /// Signed nonce (opaque to this client)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    /// Client understands header frames
    pub headers: bool,
    /// Client wants 503 statuses for requests nobody answers
    pub no_responders: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: true,
            user: None,
            pass: None,
            auth_token: None,
            jwt: None,
            nkey: None,
            sig: None,
            headers: true,
            no_responders: true,
        }
    }
}

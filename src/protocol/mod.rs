//! Wire protocol types
//!
//! The control protocol is text-delimited: a CRLF-terminated keyword line,
//! optionally followed by a length-framed payload (and, for the header
//! variants, a header block). See `codec` for framing, `headers` for the
//! header block, and `info` for the handshake JSON payloads.

pub mod codec;
pub mod headers;
pub mod info;

pub use codec::{OpParser, ServerOp};
pub use headers::{HeaderMap, ParsedHeaders};
pub use info::{ConnectInfo, ServerInfo};

use bytes::Bytes;

use crate::error::ProtocolError;

/// One delivered message
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published to
    pub subject: String,
    /// Reply subject for request/reply, if any
    pub reply: Option<String>,
    /// Message headers, if the frame carried any
    pub headers: Option<HeaderMap>,
    /// Message payload
    pub payload: Bytes,
    /// Status code from the header block (control messages), if any
    pub status: Option<u16>,
    /// Status description from the header block, if any
    pub description: Option<String>,
    /// Subscription identifier the server routed this to
    pub(crate) sid: u64,
}

impl Message {
    /// Subscription identifier this message was delivered on
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Whether this is a zero-payload control message with the given status
    pub fn is_status(&self, code: u16) -> bool {
        self.status == Some(code) && self.payload.is_empty()
    }
}

/// Validate a subject for publishing (no wildcards, no whitespace)
pub(crate) fn validate_publish_subject(subject: &str) -> Result<(), ProtocolError> {
    if subject.is_empty()
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject
            .split('.')
            .any(|tok| tok.is_empty() || tok == "*" || tok == ">")
        || subject.chars().any(|c| c.is_ascii_whitespace())
    {
        return Err(ProtocolError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Validate a subscription subject (wildcards allowed; `>` only terminal)
pub(crate) fn validate_subscribe_subject(subject: &str) -> Result<(), ProtocolError> {
    if subject.is_empty()
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject.chars().any(|c| c.is_ascii_whitespace())
    {
        return Err(ProtocolError::InvalidSubject(subject.to_string()));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (idx, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return Err(ProtocolError::InvalidSubject(subject.to_string()));
        }
        if *tok == ">" && idx != tokens.len() - 1 {
            return Err(ProtocolError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

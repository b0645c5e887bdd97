//! Message header block encoding
//!
//! Header-carrying frames (HPUB/HMSG) prefix the payload with a block of the
//! form `NATS/1.0[ <code>[ <description>]]\r\nName: Value\r\n...\r\n\r\n`.
//! Status-only frames (heartbeats, flow control, no-responders) carry a code
//! on the version line and an empty payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Version prefix every header block starts with
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Idle heartbeat / flow control status code
pub const STATUS_CONTROL: u16 = 100;
/// No messages available for a pull request
pub const STATUS_NO_MESSAGES: u16 = 404;
/// Pull request expired server-side
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Pull request conflict (e.g. exceeded limits, consumer deleted)
pub const STATUS_CONFLICT: u16 = 409;
/// No responders are listening on the subject
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Expected last sequence for the message's subject (optimistic concurrency)
pub const HDR_EXPECTED_LAST_SUBJECT_SEQUENCE: &str = "Nats-Expected-Last-Subject-Sequence";
/// Rollup marker (purges prior revisions of the subject)
pub const HDR_ROLLUP: &str = "Nats-Rollup";
/// Key-value operation marker (PUT is implied when absent)
pub const HDR_KV_OPERATION: &str = "KV-Operation";
/// Last consumer sequence, attached to idle heartbeats
pub const HDR_LAST_CONSUMER: &str = "Nats-Last-Consumer";
/// Last stream sequence, attached to idle heartbeats
pub const HDR_LAST_STREAM: &str = "Nats-Last-Stream";
/// Original subject of a direct-get response
pub const HDR_SUBJECT: &str = "Nats-Subject";
/// Stream sequence of a direct-get response
pub const HDR_SEQUENCE: &str = "Nats-Sequence";
/// Publish timestamp of a direct-get response
pub const HDR_TIME_STAMP: &str = "Nats-Time-Stamp";

/// Rollup scope: all prior messages for the same subject
pub const ROLLUP_SUBJECT: &str = "sub";

/// Ordered multi-map of header names to values
///
/// Lookup is case-insensitive per the wire format; insertion order is
/// preserved for encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for a name, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of header entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Encode the full header block, including the version line and the
    /// terminating blank line
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_VERSION.len() + 4 + self.entries.len() * 32);
        buf.put_slice(HEADER_VERSION.as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in &self.entries {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Decoded header block: optional status line fields plus the map
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    /// Status code from the version line, if any
    pub status: Option<u16>,
    /// Free-text description following the status code, if any
    pub description: Option<String>,
    /// Header entries
    pub map: HeaderMap,
}

/// Parse a raw header block (without the trailing payload)
pub fn parse_headers(raw: &[u8]) -> Result<ParsedHeaders, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::BadHeaders("header block is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let version_line = lines
        .next()
        .ok_or_else(|| ProtocolError::BadHeaders("empty header block".to_string()))?;

    if !version_line.starts_with(HEADER_VERSION) {
        return Err(ProtocolError::BadHeaders(format!(
            "unexpected version line: {}",
            version_line
        )));
    }

    let mut parsed = ParsedHeaders::default();
    let rest = version_line[HEADER_VERSION.len()..].trim();
    if !rest.is_empty() {
        let mut parts = rest.splitn(2, ' ');
        if let Some(code) = parts.next() {
            parsed.status = Some(code.parse().map_err(|_| {
                ProtocolError::BadHeaders(format!("invalid status code: {}", code))
            })?);
        }
        if let Some(desc) = parts.next() {
            let desc = desc.trim();
            if !desc.is_empty() {
                parsed.description = Some(desc.to_string());
            }
        }
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ProtocolError::BadHeaders(format!("header line without colon: {}", line))
        })?;
        parsed.map.insert(name.trim(), value.trim());
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", "abc-1");
        headers.insert(HDR_KV_OPERATION, "DEL");

        let encoded = headers.encode();
        let parsed = parse_headers(&encoded).unwrap();

        assert!(parsed.status.is_none());
        assert_eq!(parsed.map.get("nats-msg-id"), Some("abc-1"));
        assert_eq!(parsed.map.get(HDR_KV_OPERATION), Some("DEL"));
        assert_eq!(parsed.map.len(), 2);
    }

    #[test]
    fn test_status_line() {
        let parsed = parse_headers(b"NATS/1.0 503\r\n\r\n").unwrap();
        assert_eq!(parsed.status, Some(STATUS_NO_RESPONDERS));
        assert!(parsed.description.is_none());
        assert!(parsed.map.is_empty());
    }

    #[test]
    fn test_status_with_description_and_headers() {
        let raw = b"NATS/1.0 100 Idle Heartbeat\r\nNats-Last-Consumer: 42\r\n\r\n";
        let parsed = parse_headers(raw).unwrap();
        assert_eq!(parsed.status, Some(STATUS_CONTROL));
        assert_eq!(parsed.description.as_deref(), Some("Idle Heartbeat"));
        assert_eq!(parsed.map.get(HDR_LAST_CONSUMER), Some("42"));
    }

    #[test]
    fn test_bad_version_line() {
        assert!(parse_headers(b"HTTP/1.1 200\r\n\r\n").is_err());
    }

    #[test]
    fn test_header_line_without_colon() {
        assert!(parse_headers(b"NATS/1.0\r\nbogus line\r\n\r\n").is_err());
    }
}

//! Wire codec for the line-oriented control protocol
//!
//! Inbound frames are accumulated in [`OpParser`], which yields one
//! [`ServerOp`] per complete frame and `None` while more bytes are needed.
//! Outbound frames are encoded by the free functions below; the connection
//! driver owns write coalescing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::headers::{self, HeaderMap};
use crate::protocol::info::{ConnectInfo, ServerInfo};
use crate::protocol::Message;

/// Wire bytes for a keep-alive probe
pub const PING: &[u8] = b"PING\r\n";
/// Wire bytes for a keep-alive response
pub const PONG: &[u8] = b"PONG\r\n";

const CRLF_LEN: usize = 2;

/// One decoded server-to-client frame
#[derive(Debug)]
pub enum ServerOp {
    /// Handshake or async cluster-topology update
    Info(ServerInfo),
    /// Message delivery (MSG or HMSG)
    Msg(Message),
    /// Keep-alive probe from the server
    Ping,
    /// Keep-alive response from the server
    Pong,
    /// Verbose-mode acknowledgement
    Ok,
    /// Server-reported error text
    Err(String),
}

/// Incremental parser over a growable receive buffer
#[derive(Debug, Default)]
pub struct OpParser {
    buf: BytesMut,
}

impl OpParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame.
    pub fn next_op(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            return Ok(None);
        };

        let line = std::str::from_utf8(&self.buf[..line_end])
            .map_err(|_| ProtocolError::Parse("control line is not UTF-8".to_string()))?;

        let (keyword, args) = match line.find(|c: char| c.is_ascii_whitespace()) {
            Some(idx) => (&line[..idx], line[idx..].trim_start()),
            None => (line, ""),
        };

        if keyword.eq_ignore_ascii_case("MSG") {
            let args = args.to_string();
            return self.parse_msg(line_end, &args, false);
        }
        if keyword.eq_ignore_ascii_case("HMSG") {
            let args = args.to_string();
            return self.parse_msg(line_end, &args, true);
        }
        if keyword.eq_ignore_ascii_case("INFO") {
            let info: ServerInfo = serde_json::from_str(args)
                .map_err(|e| ProtocolError::Parse(format!("invalid INFO payload: {}", e)))?;
            self.buf.advance(line_end + CRLF_LEN);
            return Ok(Some(ServerOp::Info(info)));
        }
        if keyword.eq_ignore_ascii_case("PING") {
            self.buf.advance(line_end + CRLF_LEN);
            return Ok(Some(ServerOp::Ping));
        }
        if keyword.eq_ignore_ascii_case("PONG") {
            self.buf.advance(line_end + CRLF_LEN);
            return Ok(Some(ServerOp::Pong));
        }
        if keyword.eq_ignore_ascii_case("+OK") {
            self.buf.advance(line_end + CRLF_LEN);
            return Ok(Some(ServerOp::Ok));
        }
        if keyword.eq_ignore_ascii_case("-ERR") {
            let text = args.trim().trim_matches('\'').to_string();
            self.buf.advance(line_end + CRLF_LEN);
            return Ok(Some(ServerOp::Err(text)));
        }

        Err(ProtocolError::Parse(format!("unknown frame: {}", line)))
    }

    /// Parse MSG/HMSG once the control line is complete
    ///
    /// `MSG <subject> <sid> [reply] <#bytes>`
    /// `HMSG <subject> <sid> [reply] <#hdr-bytes> <#total-bytes>`
    fn parse_msg(
        &mut self,
        line_end: usize,
        args: &str,
        with_headers: bool,
    ) -> Result<Option<ServerOp>, ProtocolError> {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        let expected = if with_headers { (4, 5) } else { (3, 4) };
        if parts.len() != expected.0 && parts.len() != expected.1 {
            return Err(ProtocolError::Parse(format!(
                "malformed message header: {}",
                args
            )));
        }
        let has_reply = parts.len() == expected.1;

        let subject = parts[0].to_string();
        let sid: u64 = parts[1]
            .parse()
            .map_err(|_| ProtocolError::Parse(format!("invalid sid: {}", parts[1])))?;
        let reply = if has_reply {
            Some(parts[2].to_string())
        } else {
            None
        };

        let parse_len = |s: &str| {
            s.parse::<usize>()
                .map_err(|_| ProtocolError::Parse(format!("invalid length: {}", s)))
        };
        let (header_len, total_len) = if with_headers {
            let base = if has_reply { 3 } else { 2 };
            (parse_len(parts[base])?, parse_len(parts[base + 1])?)
        } else {
            let base = if has_reply { 3 } else { 2 };
            (0, parse_len(parts[base])?)
        };
        if header_len > total_len {
            return Err(ProtocolError::Parse(format!(
                "header length {} exceeds total {}",
                header_len, total_len
            )));
        }

        let body_start = line_end + CRLF_LEN;
        let frame_end = body_start + total_len + CRLF_LEN;
        if self.buf.len() < frame_end {
            return Ok(None);
        }

        let body = &self.buf[body_start..body_start + total_len];
        let (parsed_headers, payload) = if with_headers {
            let parsed = headers::parse_headers(&body[..header_len])?;
            (Some(parsed), Bytes::copy_from_slice(&body[header_len..]))
        } else {
            (None, Bytes::copy_from_slice(body))
        };

        let mut message = Message {
            subject,
            reply,
            headers: None,
            payload,
            status: None,
            description: None,
            sid,
        };
        if let Some(parsed) = parsed_headers {
            message.status = parsed.status;
            message.description = parsed.description;
            if !parsed.map.is_empty() {
                message.headers = Some(parsed.map);
            }
        }

        self.buf.advance(frame_end);
        Ok(Some(ServerOp::Msg(message)))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Encode a CONNECT frame
pub fn encode_connect(info: &ConnectInfo) -> Bytes {
    // ConnectInfo serialization cannot fail: plain fields, no maps
    let json = serde_json::to_string(info).unwrap_or_default();
    let mut buf = BytesMut::with_capacity(8 + json.len() + CRLF_LEN);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(json.as_bytes());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a PUB or HPUB frame, choosing the header variant when needed
pub fn encode_publish(
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &[u8],
) -> Bytes {
    let header_block = headers.map(|h| h.encode());
    let mut buf = BytesMut::with_capacity(
        32 + subject.len()
            + reply.map_or(0, str::len)
            + header_block.as_ref().map_or(0, |h| h.len())
            + payload.len(),
    );

    match &header_block {
        Some(block) => {
            buf.put_slice(b"HPUB ");
            buf.put_slice(subject.as_bytes());
            buf.put_u8(b' ');
            if let Some(reply) = reply {
                buf.put_slice(reply.as_bytes());
                buf.put_u8(b' ');
            }
            let total = block.len() + payload.len();
            buf.put_slice(format!("{} {}\r\n", block.len(), total).as_bytes());
            buf.put_slice(block);
        }
        None => {
            buf.put_slice(b"PUB ");
            buf.put_slice(subject.as_bytes());
            buf.put_u8(b' ');
            if let Some(reply) = reply {
                buf.put_slice(reply.as_bytes());
                buf.put_u8(b' ');
            }
            buf.put_slice(format!("{}\r\n", payload.len()).as_bytes());
        }
    }
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a SUB frame
pub fn encode_subscribe(subject: &str, queue_group: Option<&str>, sid: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + subject.len() + queue_group.map_or(0, str::len));
    buf.put_slice(b"SUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(queue) = queue_group {
        buf.put_slice(queue.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(format!("{}\r\n", sid).as_bytes());
    buf.freeze()
}

/// Encode an UNSUB frame, optionally with a remaining-message threshold
pub fn encode_unsubscribe(sid: u64, max: Option<u64>) -> Bytes {
    let text = match max {
        Some(max) => format!("UNSUB {} {}\r\n", sid, max),
        None => format!("UNSUB {}\r\n", sid),
    };
    Bytes::from(text)
}

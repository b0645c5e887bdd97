//! Scripted in-process server for stream-engine tests
//!
//! Speaks just enough of the wire protocol to drive the consumer and
//! key-value paths end to end: handshake, SUB/UNSUB bookkeeping, PUB and
//! HPUB parsing, and a per-test handler deciding what every inbound
//! publish gets back. Returned frames are routed to the matching live
//! subscription the way the real server would route them.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::headers::{parse_headers, ParsedHeaders};

const INFO: &[u8] = b"INFO {\"server_id\":\"scripted\",\"proto\":1,\"headers\":true,\"max_payload\":1048576,\"jetstream\":true}\r\n";

/// One publish as the scripted server saw it
pub(crate) struct Inbound {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<ParsedHeaders>,
    pub payload: Vec<u8>,
}

impl Inbound {
    /// Parse the payload as JSON; empty bodies become `null`
    pub(crate) fn json(&self) -> serde_json::Value {
        if self.payload.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// One frame the handler wants sent back through a live subscription
pub(crate) struct Outgoing {
    /// Subject the routing decision is made on
    route: String,
    /// Subject written on the wire
    subject: String,
    reply: Option<String>,
    /// Raw header block, version line through the blank line
    headers: Option<String>,
    payload: Vec<u8>,
}

impl Outgoing {
    /// JSON reply to a request
    pub(crate) fn json(reply_to: &str, body: serde_json::Value) -> Self {
        Self {
            route: reply_to.to_string(),
            subject: reply_to.to_string(),
            reply: None,
            headers: None,
            payload: body.to_string().into_bytes(),
        }
    }

    /// Stream delivery into a consumer inbox, carrying an ack reply subject
    pub(crate) fn delivery(inbox: &str, subject: &str, ack: &str, payload: &[u8]) -> Self {
        Self {
            route: inbox.to_string(),
            subject: subject.to_string(),
            reply: Some(ack.to_string()),
            headers: None,
            payload: payload.to_vec(),
        }
    }

    /// Headers-carrying frame, for statuses and direct-get responses
    pub(crate) fn with_headers(to: &str, headers: &str, payload: &[u8]) -> Self {
        Self {
            route: to.to_string(),
            subject: to.to_string(),
            reply: None,
            headers: Some(headers.to_string()),
            payload: payload.to_vec(),
        }
    }
}

pub(crate) type Handler = Arc<dyn Fn(&Inbound) -> Vec<Outgoing> + Send + Sync>;

/// Start the scripted server; returns a connect URL
pub(crate) async fn start(handler: Handler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(serve(stream, Arc::clone(&handler)));
        }
    });
    format!("nats://{}", addr)
}

struct Sub {
    pattern: String,
    sid: u64,
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(p), Some(s)) if p == "*" || p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

async fn serve(stream: TcpStream, handler: Handler) {
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);
    wr.write_all(INFO).await.unwrap();

    let mut subs: Vec<Sub> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let parts: Vec<String> = line
            .trim_end()
            .split_ascii_whitespace()
            .map(str::to_string)
            .collect();
        match parts.first().map(String::as_str) {
            Some("CONNECT") => {}
            Some("PING") => wr.write_all(b"PONG\r\n").await.unwrap(),
            Some("SUB") => {
                // Queue groups never appear in these tests
                subs.push(Sub {
                    pattern: parts[1].clone(),
                    sid: parts.last().unwrap().parse().unwrap(),
                });
            }
            Some("UNSUB") => {
                if parts.len() == 2 {
                    let sid: u64 = parts[1].parse().unwrap();
                    subs.retain(|s| s.sid != sid);
                }
            }
            Some("PUB") | Some("HPUB") => {
                let with_headers = parts[0] == "HPUB";
                let subject = parts[1].clone();
                let fixed = if with_headers { 4 } else { 3 };
                let reply = (parts.len() > fixed).then(|| parts[2].clone());
                let total: usize = parts.last().unwrap().parse().unwrap();
                let mut body = vec![0u8; total + 2];
                reader.read_exact(&mut body).await.unwrap();
                body.truncate(total);

                let (headers, payload) = if with_headers {
                    let header_len: usize = parts[parts.len() - 2].parse().unwrap();
                    let parsed = parse_headers(&body[..header_len]).unwrap();
                    (Some(parsed), body[header_len..].to_vec())
                } else {
                    (None, body)
                };

                let inbound = Inbound {
                    subject,
                    reply,
                    headers,
                    payload,
                };
                for out in handler(&inbound) {
                    send(&mut wr, &subs, &out).await;
                }
            }
            _ => {}
        }
    }
}

async fn send(
    wr: &mut tokio::net::tcp::OwnedWriteHalf,
    subs: &[Sub],
    out: &Outgoing,
) {
    let Some(sub) = subs.iter().find(|s| subject_matches(&s.pattern, &out.route)) else {
        return;
    };
    let reply = out
        .reply
        .as_ref()
        .map(|r| format!(" {}", r))
        .unwrap_or_default();
    match &out.headers {
        Some(headers) => {
            let total = headers.len() + out.payload.len();
            let head = format!(
                "HMSG {} {}{} {} {}\r\n",
                out.subject,
                sub.sid,
                reply,
                headers.len(),
                total
            );
            wr.write_all(head.as_bytes()).await.unwrap();
            wr.write_all(headers.as_bytes()).await.unwrap();
        }
        None => {
            let head = format!(
                "MSG {} {}{} {}\r\n",
                out.subject,
                sub.sid,
                reply,
                out.payload.len()
            );
            wr.write_all(head.as_bytes()).await.unwrap();
        }
    }
    wr.write_all(&out.payload).await.unwrap();
    wr.write_all(b"\r\n").await.unwrap();
}

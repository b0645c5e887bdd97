//! Client handle
//!
//! Cheap to clone; every clone talks to the same driver task over the
//! command channel. Publishing encodes frames on the caller's task so the
//! driver only writes.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::connection::config::ConnectOptions;
use crate::connection::driver::{Command, ConnectionDriver, Shared};
use crate::connection::events::Event;
use crate::connection::servers::ServerPool;
use crate::connection::state::ConnectionState;
use crate::error::{ConnectionError, Error, ProtocolError, RequestError, Result};
use crate::jetstream::JetStream;
use crate::protocol::headers::{HeaderMap, STATUS_NO_RESPONDERS};
use crate::protocol::info::ServerInfo;
use crate::protocol::{codec, validate_publish_subject, validate_subscribe_subject, Message};
use crate::stats::StatsSnapshot;
use crate::subscription::inbox;
use crate::subscription::registry::Sink;
use crate::subscription::Subscriber;

const COMMAND_CAPACITY: usize = 1024;

/// Length of the random token in [`Client::new_inbox`] subjects
const INBOX_TOKEN_LEN: usize = 16;

/// Connect to one server with default options
pub async fn connect(url: impl Into<String>) -> Result<Client> {
    connect_with_options(ConnectOptions::new().server(url.into())).await
}

/// Connect with explicit options
pub async fn connect_with_options(options: ConnectOptions) -> Result<Client> {
    let pool = ServerPool::from_urls(&options.servers, options.no_randomize)?;
    let shared = Arc::new(Shared::new(&options));
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);

    let mut driver = ConnectionDriver::new(Arc::clone(&shared), options.clone(), pool, cmd_rx);
    driver.initial_connect().await?;
    tokio::spawn(driver.run());

    Ok(Client {
        shared,
        cmd_tx,
        options: Arc::new(options),
    })
}

/// Handle to one connection
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
    options: Arc<ConnectOptions>,
}

impl Client {
    /// Publish a message
    pub async fn publish(&self, subject: impl AsRef<str>, payload: Bytes) -> Result<()> {
        self.publish_frame(subject.as_ref(), None, None, payload)
            .await
    }

    /// Publish with an explicit reply subject
    pub async fn publish_with_reply(
        &self,
        subject: impl AsRef<str>,
        reply: impl AsRef<str>,
        payload: Bytes,
    ) -> Result<()> {
        self.publish_frame(subject.as_ref(), Some(reply.as_ref()), None, payload)
            .await
    }

    /// Publish with headers
    pub async fn publish_with_headers(
        &self,
        subject: impl AsRef<str>,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<()> {
        self.publish_frame(subject.as_ref(), None, Some(&headers), payload)
            .await
    }

    pub(crate) async fn publish_frame(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        validate_publish_subject(subject)?;
        let max = self.shared.max_payload.load(Ordering::Relaxed);
        if max > 0 && payload.len() > max {
            return Err(Error::Protocol(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max,
            }));
        }
        let frame = codec::encode_publish(subject, reply, headers, &payload);
        self.ensure_can_send(frame.len())?;
        self.cmd_tx
            .send(Command::Publish { frame })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))
    }

    /// Publish and await a single reply
    pub async fn request(&self, subject: impl AsRef<str>, payload: Bytes) -> Result<Message> {
        self.request_inner(subject.as_ref(), None, payload).await
    }

    /// Request with headers on the outbound message
    pub async fn request_with_headers(
        &self,
        subject: impl AsRef<str>,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<Message> {
        self.request_inner(subject.as_ref(), Some(headers), payload)
            .await
    }

    pub(crate) async fn request_inner(
        &self,
        subject: &str,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<Message> {
        let (reply, rx) = self.shared.requests.new_request();
        if let Err(e) = self
            .publish_frame(subject, Some(&reply), headers.as_ref(), payload)
            .await
        {
            self.shared.requests.cancel(&reply);
            return Err(e);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Err(_) => {
                self.shared.requests.cancel(&reply);
                Err(Error::Request(RequestError::Timeout))
            }
            Ok(Err(_)) => Err(Error::Connection(ConnectionError::Closed)),
            Ok(Ok(msg)) => {
                if msg.is_status(STATUS_NO_RESPONDERS) {
                    Err(Error::Request(RequestError::NoResponders))
                } else {
                    Ok(msg)
                }
            }
        }
    }

    /// Subscribe to a subject (wildcards allowed)
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber> {
        self.subscribe_inner(subject.into(), None).await
    }

    /// Subscribe as a member of a queue group
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscriber> {
        self.subscribe_inner(subject.into(), Some(queue_group.into()))
            .await
    }

    async fn subscribe_inner(
        &self,
        subject: String,
        queue_group: Option<String>,
    ) -> Result<Subscriber> {
        validate_subscribe_subject(&subject)?;
        match self.shared.state.get() {
            ConnectionState::Closed => {
                return Err(Error::Connection(ConnectionError::Closed));
            }
            ConnectionState::Draining => {
                return Err(Error::Connection(ConnectionError::Draining));
            }
            _ => {}
        }

        let sid = self.shared.alloc_sid();
        let (tx, rx) = mpsc::channel(self.options.subscription_capacity);
        self.cmd_tx
            .send(Command::Subscribe {
                sid,
                subject: subject.clone(),
                queue_group,
                sink: Sink::Channel(tx),
            })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?;
        Ok(Subscriber::new(sid, subject, rx, self.cmd_tx.clone()))
    }

    /// Round-trip a PING; resolves once every prior frame has been
    /// processed by the server
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { respond: tx })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?
    }

    /// Stop deliveries, wait for in-flight messages, then close
    pub async fn drain(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Drain { respond: tx })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?
    }

    /// Close immediately, discarding buffered work
    pub async fn close(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Close)
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))
    }

    /// Resolves once the connection reaches its terminal state
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.closed.notified();
            if self.shared.state.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Point-in-time counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Metadata from the most recent handshake
    pub fn server_info(&self) -> ServerInfo {
        self.shared
            .server_info
            .lock()
            .map(|info| info.clone())
            .unwrap_or_default()
    }

    /// Subscribe to connection status events
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// A unique subject suitable as a one-off reply address
    pub fn new_inbox(&self) -> String {
        format!(
            "{}.{}",
            self.options.inbox_prefix,
            inbox::random_token(INBOX_TOKEN_LEN)
        )
    }

    /// Persistent-stream context over this connection
    pub fn jetstream(&self) -> JetStream {
        JetStream::new(self.clone())
    }

    pub(crate) fn emit_event(&self, event: Event) {
        self.shared.events.emit(event);
    }

    fn ensure_can_send(&self, frame_len: usize) -> Result<()> {
        match self.shared.state.get() {
            ConnectionState::Closed => Err(Error::Connection(ConnectionError::Closed)),
            ConnectionState::Draining => Err(Error::Connection(ConnectionError::Draining)),
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                let limit = self.options.reconnect_buffer_size;
                if self.shared.stats.buffered() + frame_len > limit {
                    Err(Error::Connection(ConnectionError::ReconnectBufferExceeded {
                        limit,
                    }))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.shared.state.get())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const MOCK_INFO: &[u8] =
        b"INFO {\"server_id\":\"mock\",\"proto\":1,\"headers\":true,\"max_payload\":1048576}\r\n";

    struct MockSub {
        pattern: String,
        sid: u64,
        remaining: Option<u64>,
    }

    fn subject_matches(pattern: &str, subject: &str) -> bool {
        match pattern.strip_suffix(".>") {
            Some(prefix) => {
                subject.len() > prefix.len() + 1 && subject.starts_with(prefix)
            }
            None => pattern == subject,
        }
    }

    /// Minimal broker: routes PUB to matching SUBs on the same connection
    /// and answers unrouted requests with a 503 status
    async fn serve_conn(stream: TcpStream) {
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        wr.write_all(MOCK_INFO).await.unwrap();

        let mut subs: Vec<MockSub> = Vec::new();
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
                    let sid: u64 = parts.last().unwrap().parse().unwrap();
                    subs.push(MockSub {
                        pattern: parts[1].clone(),
                        sid,
                        remaining: None,
                    });
                }
                Some("UNSUB") => {
                    let sid: u64 = parts[1].parse().unwrap();
                    match parts.get(2) {
                        Some(max) => {
                            let max: u64 = max.parse().unwrap();
                            for sub in subs.iter_mut().filter(|s| s.sid == sid) {
                                sub.remaining = Some(max);
                            }
                        }
                        None => subs.retain(|s| s.sid != sid),
                    }
                }
                Some("PUB") => {
                    let subject = parts[1].clone();
                    let (reply, len): (Option<String>, usize) = if parts.len() == 4 {
                        (Some(parts[2].clone()), parts[3].parse().unwrap())
                    } else {
                        (None, parts[2].parse().unwrap())
                    };
                    let mut payload = vec![0u8; len + 2];
                    reader.read_exact(&mut payload).await.unwrap();
                    payload.truncate(len);

                    let mut routed = false;
                    for sub in &mut subs {
                        if !subject_matches(&sub.pattern, &subject) {
                            continue;
                        }
                        if sub.remaining == Some(0) {
                            continue;
                        }
                        let head = match &reply {
                            Some(r) => format!("MSG {} {} {} {}\r\n", subject, sub.sid, r, len),
                            None => format!("MSG {} {} {}\r\n", subject, sub.sid, len),
                        };
                        wr.write_all(head.as_bytes()).await.unwrap();
                        wr.write_all(&payload).await.unwrap();
                        wr.write_all(b"\r\n").await.unwrap();
                        if let Some(rem) = &mut sub.remaining {
                            *rem -= 1;
                        }
                        routed = true;
                    }
                    subs.retain(|s| s.remaining != Some(0));

                    if !routed {
                        if let Some(r) = reply {
                            let status = "NATS/1.0 503\r\n\r\n";
                            for sub in &subs {
                                if subject_matches(&sub.pattern, &r) {
                                    let head = format!(
                                        "HMSG {} {} {} {}\r\n",
                                        r,
                                        sub.sid,
                                        status.len(),
                                        status.len()
                                    );
                                    wr.write_all(head.as_bytes()).await.unwrap();
                                    wr.write_all(status.as_bytes()).await.unwrap();
                                    wr.write_all(b"\r\n").await.unwrap();
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    async fn start_mock() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(serve_conn(stream));
            }
        });
        format!("nats://{}", addr)
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut sub = client.subscribe("events.created").await.unwrap();
        client
            .publish("events.created", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        client.flush().await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "events.created");
        assert_eq!(&msg.payload[..], b"hello");

        let stats = client.stats();
        assert!(stats.msgs_out >= 1);
        assert!(stats.msgs_in >= 1);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reply() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();

        let mut service = client.subscribe("svc.echo").await.unwrap();
        let responder = client.clone();
        tokio::spawn(async move {
            while let Some(msg) = service.next().await {
                if let Some(reply) = msg.reply {
                    responder
                        .publish(reply, Bytes::from_static(b"echoed"))
                        .await
                        .unwrap();
                }
            }
        });

        let reply = client
            .request("svc.echo", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"echoed");
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();

        let err = client
            .request("nobody.home", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(RequestError::NoResponders)));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let url = start_mock().await;
        let client = connect_with_options(
            ConnectOptions::new()
                .server(url)
                .request_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        // A subscriber that never answers keeps the request pending
        let mut silent = client.subscribe("svc.slow").await.unwrap();
        let request = client.request("svc.slow", Bytes::new());
        let err = request.await.unwrap_err();
        assert!(matches!(err, Error::Request(RequestError::Timeout)));
        assert!(silent.next().await.is_some());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_after_caps_deliveries() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();

        let mut sub = client.subscribe("feed.ticks").await.unwrap();
        sub.unsubscribe_after(2).await.unwrap();
        for i in 0..3u8 {
            client
                .publish("feed.ticks", Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        assert_eq!(&sub.next().await.unwrap().payload[..], &[0]);
        assert_eq!(&sub.next().await.unwrap().payload[..], &[1]);
        assert!(sub.next().await.is_none());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_publish_subject() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();
        let err = client
            .publish("orders.*", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_ends_subscriptions_and_closes() {
        let url = start_mock().await;
        let client = connect(url).await.unwrap();
        let mut sub = client.subscribe("jobs.work").await.unwrap();

        client.drain().await.unwrap();
        assert!(sub.next().await.is_none());
        assert_eq!(client.state(), ConnectionState::Closed);

        // New work is refused after the terminal state
        let err = client.publish("jobs.work", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
        client.closed().await;
    }

    #[tokio::test]
    async fn test_retry_on_initial_connect_reports_first_success_as_connected() {
        // Reserve a port, then leave it unbound so the first pass fails
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = connect_with_options(
            ConnectOptions::new()
                .server(format!("nats://{}", addr))
                .retry_on_initial_connect()
                .reconnect_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        let mut events = client.events();

        // Only now does a server appear
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(serve_conn(stream));
            }
        });

        // The retry loop's first success is an initial connect, not a
        // reconnect
        match events.recv().await.unwrap() {
            Event::Connected => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.stats().reconnects, 0);
        assert_eq!(client.stats().connects, 1);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("nats://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            // First connection: handshake, then hang up once a real
            // subscription shows up
            let (stream, _) = listener.accept().await.unwrap();
            {
                let (rd, mut wr) = stream.into_split();
                let mut reader = BufReader::new(rd);
                wr.write_all(MOCK_INFO).await.unwrap();
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    let trimmed = line.trim_end();
                    if trimmed == "PING" {
                        wr.write_all(b"PONG\r\n").await.unwrap();
                    } else if trimmed.starts_with("SUB ") && !trimmed.contains("_INBOX") {
                        break;
                    }
                }
            }
            // Second connection gets full service
            let (stream, _) = listener.accept().await.unwrap();
            serve_conn(stream).await;
        });

        let client = connect_with_options(
            ConnectOptions::new()
                .server(url)
                .reconnect_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        let mut events = client.events();
        let mut sub = client.subscribe("events.after").await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                Event::Reconnected { .. } => break,
                _ => {}
            }
        }
        assert!(client.stats().reconnects >= 1);

        client
            .publish("events.after", Bytes::from_static(b"survived"))
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(&msg.payload[..], b"survived");
        client.close().await.unwrap();
    }
}

//! Connection driver task
//!
//! All wire I/O funnels through a single spawned task that owns the write
//! half, the subscription registry, and the reconnect loop. Client handles
//! talk to it over a command channel; a per-transport read task decodes
//! frames and forwards them tagged with a transport epoch, so frames from a
//! dead transport are ignored once a new one is up.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::connection::config::ConnectOptions;
use crate::connection::events::{Event, EventBus};
use crate::connection::servers::{ServerAddr, ServerPool};
use crate::connection::state::{ConnectionState, StateCell};
use crate::error::{ConnectionError, Error, Result, ServerError};
use crate::protocol::codec::{self, OpParser, ServerOp};
use crate::protocol::info::{ConnectInfo, ServerInfo};
use crate::stats::ClientStats;
use crate::subscription::inbox::RequestMap;
use crate::subscription::registry::{Delivery, Sink, SubscriptionRegistry};

const READ_CHUNK: usize = 8 * 1024;
const READ_CHANNEL_CAPACITY: usize = 1024;
const RECONNECT_JITTER_MS: u64 = 500;

/// State shared between client handles and the driver task
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) requests: RequestMap,
    pub(crate) events: EventBus,
    pub(crate) stats: ClientStats,
    pub(crate) server_info: Mutex<ServerInfo>,
    /// Server-advertised payload ceiling; 0 until the first handshake
    pub(crate) max_payload: AtomicUsize,
    /// Next sid to hand out; sids are never reused
    pub(crate) next_sid: AtomicU64,
    pub(crate) closed: Notify,
}

impl Shared {
    pub(crate) fn new(options: &ConnectOptions) -> Self {
        Self {
            state: StateCell::new(),
            requests: RequestMap::new(&options.inbox_prefix),
            events: EventBus::new(),
            stats: ClientStats::new(),
            server_info: Mutex::new(ServerInfo::default()),
            max_payload: AtomicUsize::new(0),
            next_sid: AtomicU64::new(1),
            closed: Notify::new(),
        }
    }

    pub(crate) fn alloc_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }
}

/// Instruction from a client handle to the driver
#[derive(Debug)]
pub(crate) enum Command {
    /// Write one pre-encoded frame (buffered while reconnecting)
    Publish { frame: Bytes },
    /// Register a subscription and put its SUB on the wire
    Subscribe {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        sink: Sink,
    },
    /// Remove a subscription, or cap it at `max` total deliveries
    Unsubscribe { sid: u64, max: Option<u64> },
    /// Round-trip a PING; resolves once the matching PONG arrives
    Flush { respond: oneshot::Sender<Result<()>> },
    /// Unsubscribe everything, wait for in-flight deliveries, then close
    Drain { respond: oneshot::Sender<Result<()>> },
    /// Terminate immediately
    Close,
}

/// What one outstanding PING is waiting for
#[derive(Debug)]
enum PingSlot {
    /// Interval keep-alive, nobody waiting
    KeepAlive,
    /// A flush call awaiting the round trip
    Flush(oneshot::Sender<Result<()>>),
    /// The drain barrier: every frame before it has been processed
    DrainBarrier(oneshot::Sender<Result<()>>),
}

/// Output of one transport's read task
#[derive(Debug)]
enum ReadEvent {
    Op(ServerOp),
    Eof,
    Failed(Error),
}

/// The connection driver; consumed by [`ConnectionDriver::run`]
pub(crate) struct ConnectionDriver {
    shared: Arc<Shared>,
    options: ConnectOptions,
    pool: ServerPool,
    registry: SubscriptionRegistry,
    cmd_rx: mpsc::Receiver<Command>,
    read_tx: mpsc::Sender<(u64, ReadEvent)>,
    read_rx: mpsc::Receiver<(u64, ReadEvent)>,
    write: Option<OwnedWriteHalf>,
    /// Incremented per transport; stale read events carry an older value
    epoch: u64,
    /// FIFO of outstanding PINGs; length bounds unanswered probes
    pings: VecDeque<PingSlot>,
    ping_timer: tokio::time::Interval,
    /// Frames held back while reconnecting, flushed on the new transport
    buffered: Vec<Bytes>,
    reconnect_at: Option<Instant>,
    reconnect_passes: usize,
    /// Whether any handshake has ever succeeded; the first success reports
    /// `Connected` even when it happens inside the retry loop
    ever_connected: bool,
}

impl ConnectionDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        options: ConnectOptions,
        pool: ServerPool,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let mut registry = SubscriptionRegistry::new();

        // The request/reply inbox wildcard is the first subscription; its
        // SUB goes out with every (re)connect like any other.
        let inbox_sid = shared.alloc_sid();
        registry.insert(
            inbox_sid,
            shared.requests.wildcard_subject(),
            None,
            Sink::Request,
        );

        let mut ping_timer = tokio::time::interval(options.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Self {
            shared,
            options,
            pool,
            registry,
            cmd_rx,
            read_tx,
            read_rx,
            write: None,
            epoch: 0,
            pings: VecDeque::new(),
            ping_timer,
            buffered: Vec::new(),
            reconnect_at: None,
            reconnect_passes: 0,
            ever_connected: false,
        }
    }

    /// One pass over the pool before the driver task starts
    ///
    /// Errors propagate to the caller of `connect` unless retries on the
    /// initial connect were requested.
    pub(crate) async fn initial_connect(&mut self) -> Result<()> {
        let mut last_err: Option<Error> = None;
        for addr in self.pool.rotation() {
            match self.attempt(&addr).await {
                Ok(writer) => {
                    self.on_connected(writer, addr.endpoint()).await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(server = %addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if self.options.retry_on_initial_connect {
            self.schedule_reconnect();
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| Error::Connection(ConnectionError::AttemptsExhausted)))
    }

    /// Drive the connection until close
    pub(crate) async fn run(mut self) {
        loop {
            if self.shared.state.is_closed() {
                return;
            }
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                return;
                            }
                        }
                        // Every handle dropped; nothing can reach us again
                        None => {
                            self.finish_close();
                            return;
                        }
                    }
                }
                event = self.read_rx.recv() => {
                    if let Some((epoch, event)) = event {
                        if epoch == self.epoch {
                            if !self.handle_read_event(event).await {
                                return;
                            }
                        }
                    }
                }
                _ = self.ping_timer.tick(), if self.write.is_some() => {
                    if !self.tick_ping().await {
                        return;
                    }
                }
                _ = sleep_until_opt(self.reconnect_at), if self.reconnect_at.is_some() => {
                    if !self.reconnect_pass().await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the driver should stop
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Publish { frame } => {
                if self.write.is_some() {
                    if self.send_frame(&frame).await {
                        self.shared.stats.add_out(1, 0);
                    }
                } else if self.shared.stats.buffered() + frame.len()
                    <= self.options.reconnect_buffer_size
                {
                    self.shared.stats.add_buffered(frame.len());
                    self.buffered.push(frame);
                } else {
                    tracing::warn!(
                        limit = self.options.reconnect_buffer_size,
                        "reconnect buffer full, dropping publish"
                    );
                    self.shared
                        .events
                        .emit(Event::Error("reconnect buffer full, publish dropped".to_string()));
                }
            }
            Command::Subscribe {
                sid,
                subject,
                queue_group,
                sink,
            } => {
                let frame = codec::encode_subscribe(&subject, queue_group.as_deref(), sid);
                self.registry.insert(sid, subject, queue_group, sink);
                if self.write.is_some() {
                    self.send_frame(&frame).await;
                }
            }
            Command::Unsubscribe { sid, max } => match max {
                None => {
                    if self.registry.contains(sid) {
                        self.registry.remove(sid);
                        if self.write.is_some() {
                            let frame = codec::encode_unsubscribe(sid, None);
                            self.send_frame(&frame).await;
                        }
                    }
                }
                Some(max) => {
                    if let Some(remaining) = self.registry.set_max(sid, max) {
                        if self.write.is_some() {
                            let frame = if remaining == 0 {
                                codec::encode_unsubscribe(sid, None)
                            } else {
                                codec::encode_unsubscribe(sid, Some(remaining))
                            };
                            self.send_frame(&frame).await;
                        }
                    }
                }
            },
            Command::Flush { respond } => {
                if self.write.is_some() {
                    if self.send_frame(codec::PING).await {
                        self.pings.push_back(PingSlot::Flush(respond));
                    } else {
                        let _ = respond
                            .send(Err(Error::Connection(ConnectionError::NotConnected)));
                    }
                } else {
                    let _ =
                        respond.send(Err(Error::Connection(ConnectionError::NotConnected)));
                }
            }
            Command::Drain { respond } => {
                self.shared.state.set(ConnectionState::Draining);
                if self.write.is_none() {
                    self.finish_close();
                    let _ = respond.send(Ok(()));
                    return false;
                }
                // Stop new deliveries server-side, then fence with a PING:
                // once its PONG returns, everything in flight has been
                // written to our subscriber channels.
                for frame in self.registry.unsubscribe_all_frames() {
                    if !self.send_frame(&frame).await {
                        self.finish_close();
                        let _ = respond.send(Ok(()));
                        return false;
                    }
                }
                if self.send_frame(codec::PING).await {
                    self.pings.push_back(PingSlot::DrainBarrier(respond));
                } else {
                    self.finish_close();
                    let _ = respond.send(Ok(()));
                    return false;
                }
            }
            Command::Close => {
                self.finish_close();
                return false;
            }
        }
        true
    }

    /// Returns false when the driver should stop
    async fn handle_read_event(&mut self, event: ReadEvent) -> bool {
        match event {
            ReadEvent::Op(op) => self.handle_op(op).await,
            ReadEvent::Eof => {
                tracing::info!("server closed the connection");
                self.handle_disconnect()
            }
            ReadEvent::Failed(err) => {
                tracing::warn!(error = %err, "transport failed");
                self.shared.events.emit(Event::Error(err.to_string()));
                self.handle_disconnect()
            }
        }
    }

    async fn handle_op(&mut self, op: ServerOp) -> bool {
        match op {
            ServerOp::Msg(msg) => {
                self.shared.stats.add_in(1, 0);
                match self.registry.dispatch(msg) {
                    Delivery::Delivered | Delivery::Ignored => {}
                    Delivery::Request(msg) => {
                        let reply_subject = msg.subject.clone();
                        self.shared.requests.resolve(&reply_subject, msg);
                    }
                    Delivery::Dropped { sid, subject } => {
                        tracing::warn!(sid, subject = %subject, "subscriber lagging, message dropped");
                        self.shared.events.emit(Event::SlowConsumer { sid, subject });
                    }
                }
            }
            ServerOp::Ping => {
                self.send_frame(codec::PONG).await;
            }
            ServerOp::Pong => {
                match self.pings.pop_front() {
                    Some(PingSlot::KeepAlive) | None => {}
                    Some(PingSlot::Flush(respond)) => {
                        let _ = respond.send(Ok(()));
                    }
                    Some(PingSlot::DrainBarrier(respond)) => {
                        // Close first so the waiter observes the terminal
                        // state the moment its drain call returns
                        self.finish_close();
                        let _ = respond.send(Ok(()));
                        return false;
                    }
                }
            }
            ServerOp::Info(info) => self.handle_info(info),
            ServerOp::Ok => {}
            ServerOp::Err(text) => return self.handle_server_error(&text),
        }
        true
    }

    fn handle_info(&mut self, info: ServerInfo) {
        if info.max_payload > 0 {
            self.shared
                .max_payload
                .store(info.max_payload, Ordering::Relaxed);
        }
        if info.lame_duck_mode {
            tracing::info!("server entered lame duck mode");
            self.shared.events.emit(Event::LameDuckMode);
        }
        if !info.connect_urls.is_empty() && !self.options.ignore_discovered_servers {
            let added = self.pool.merge_discovered(&info.connect_urls);
            if !added.is_empty() {
                tracing::info!(servers = ?added, "discovered cluster peers");
                self.shared.events.emit(Event::ServersDiscovered(added));
            }
        }
        if let Ok(mut current) = self.shared.server_info.lock() {
            *current = info;
        }
    }

    fn handle_server_error(&mut self, text: &str) -> bool {
        let err = ServerError::parse(text);
        tracing::warn!(error = %err, "server reported error");
        match &err {
            ServerError::PermissionsViolation { operation, subject } => {
                self.shared.events.emit(Event::PermissionsViolation {
                    operation: operation.clone(),
                    subject: subject.clone(),
                });
            }
            _ => {
                self.shared.events.emit(Event::Error(err.to_string()));
            }
        }
        if err.is_fatal() {
            return self.handle_disconnect();
        }
        true
    }

    /// Periodic keep-alive; too many unanswered probes kills the transport
    async fn tick_ping(&mut self) -> bool {
        if self.pings.len() >= self.options.max_outstanding_pings {
            tracing::warn!(
                outstanding = self.pings.len(),
                "server unresponsive, dropping transport"
            );
            return self.handle_disconnect();
        }
        if self.send_frame(codec::PING).await {
            self.pings.push_back(PingSlot::KeepAlive);
        }
        true
    }

    /// Write one frame; on failure tears the transport down and returns false
    async fn send_frame(&mut self, frame: &[u8]) -> bool {
        let Some(writer) = self.write.as_mut() else {
            return false;
        };
        match writer.write_all(frame).await {
            Ok(()) => {
                self.shared.stats.add_out(0, frame.len() as u64);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "write failed");
                self.handle_disconnect();
                false
            }
        }
    }

    /// Transport is gone; either start reconnecting or finish a drain/close
    ///
    /// Returns false when the driver should stop.
    fn handle_disconnect(&mut self) -> bool {
        self.write = None;
        self.epoch += 1;

        // Flush waiters cannot be satisfied on a new transport
        let slots: Vec<PingSlot> = self.pings.drain(..).collect();
        let mut drain_done: Option<oneshot::Sender<Result<()>>> = None;
        for slot in slots {
            match slot {
                PingSlot::KeepAlive => {}
                PingSlot::Flush(respond) => {
                    let _ = respond.send(Err(Error::Connection(ConnectionError::NotConnected)));
                }
                PingSlot::DrainBarrier(respond) => {
                    // The server connection is gone, so the drain is moot
                    drain_done = Some(respond);
                }
            }
        }
        if let Some(respond) = drain_done {
            self.finish_close();
            let _ = respond.send(Ok(()));
            return false;
        }

        match self.shared.state.get() {
            ConnectionState::Draining | ConnectionState::Closed => {
                self.finish_close();
                false
            }
            _ => {
                self.shared.state.set(ConnectionState::Reconnecting);
                self.shared.events.emit(Event::Disconnected);
                self.reconnect_passes = 0;
                self.reconnect_at = Some(Instant::now());
                true
            }
        }
    }

    /// Returns false when reconnect attempts are exhausted
    async fn reconnect_pass(&mut self) -> bool {
        self.reconnect_at = None;
        for addr in self.pool.rotation() {
            match self.attempt(&addr).await {
                Ok(writer) => {
                    let server = addr.endpoint();
                    match self.on_connected(writer, server).await {
                        Ok(()) => return true,
                        Err(e) => {
                            tracing::warn!(error = %e, "resubscription after reconnect failed");
                            // handle_disconnect already rescheduled us
                            return !self.shared.state.is_closed();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %addr, error = %e, "reconnect attempt failed");
                }
            }
        }
        self.reconnect_passes += 1;
        if let Some(max) = self.options.max_reconnects {
            if self.reconnect_passes >= max {
                tracing::error!(passes = self.reconnect_passes, "reconnect attempts exhausted");
                self.shared
                    .events
                    .emit(Event::Error("reconnect attempts exhausted".to_string()));
                self.finish_close();
                return false;
            }
        }
        self.schedule_reconnect();
        true
    }

    fn schedule_reconnect(&mut self) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS));
        self.reconnect_at = Some(Instant::now() + self.options.reconnect_delay + jitter);
    }

    /// Dial and handshake one server under the configured timeout
    async fn attempt(&mut self, addr: &ServerAddr) -> Result<OwnedWriteHalf> {
        match tokio::time::timeout(self.options.connection_timeout, self.handshake(addr)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake timed out",
            ))),
        }
    }

    async fn handshake(&mut self, addr: &ServerAddr) -> Result<OwnedWriteHalf> {
        let stream = TcpStream::connect(addr.endpoint()).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let mut parser = OpParser::new();
        let mut buf = [0u8; READ_CHUNK];

        let info = loop {
            if let Some(op) = parser.next_op()? {
                match op {
                    ServerOp::Info(info) => break info,
                    ServerOp::Err(text) => {
                        return Err(Error::Server(ServerError::parse(&text)));
                    }
                    other => {
                        tracing::debug!(op = ?other, "unexpected frame before INFO");
                    }
                }
                continue;
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.shared.stats.add_in(0, n as u64);
            parser.extend(&buf[..n]);
        };

        if info.tls_required {
            return Err(Error::Connection(ConnectionError::TlsRequired));
        }

        let connect = self.connect_info(addr, info.nonce.as_deref())?;
        let frame = codec::encode_connect(&connect);
        writer.write_all(&frame).await?;
        writer.write_all(codec::PING).await?;
        self.shared
            .stats
            .add_out(0, (frame.len() + codec::PING.len()) as u64);

        // The PONG answering our PING completes the handshake
        loop {
            if let Some(op) = parser.next_op()? {
                match op {
                    ServerOp::Pong => break,
                    ServerOp::Ping => {
                        writer.write_all(codec::PONG).await?;
                    }
                    ServerOp::Err(text) => {
                        let err = ServerError::parse(&text);
                        if matches!(err, ServerError::AuthorizationViolation) {
                            return Err(Error::Connection(
                                ConnectionError::AuthenticationFailed(text),
                            ));
                        }
                        return Err(Error::Server(err));
                    }
                    ServerOp::Ok => {}
                    other => {
                        tracing::debug!(op = ?other, "unexpected frame during handshake");
                    }
                }
                continue;
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.shared.stats.add_in(0, n as u64);
            parser.extend(&buf[..n]);
        }

        self.handle_info(info);

        self.epoch += 1;
        tokio::spawn(read_loop(
            self.epoch,
            reader,
            parser,
            self.read_tx.clone(),
            Arc::clone(&self.shared),
        ));
        Ok(writer)
    }

    fn connect_info(&self, addr: &ServerAddr, nonce: Option<&str>) -> Result<ConnectInfo> {
        let mut info = ConnectInfo {
            name: self.options.name.clone(),
            echo: self.options.echo,
            user: addr.user.clone(),
            pass: addr.pass.clone(),
            auth_token: addr.token.clone(),
            ..Default::default()
        };
        if let Some(auth) = &self.options.auth {
            let creds = auth.credentials(nonce)?;
            if creds.user.is_some() {
                info.user = creds.user;
            }
            if creds.pass.is_some() {
                info.pass = creds.pass;
            }
            if creds.token.is_some() {
                info.auth_token = creds.token;
            }
            info.jwt = creds.jwt;
            info.nkey = creds.nkey;
            info.sig = creds.signature;
        }
        Ok(info)
    }

    /// Install the new transport, replay subscriptions, flush buffered work
    async fn on_connected(&mut self, writer: OwnedWriteHalf, server: String) -> Result<()> {
        let reconnect = self.ever_connected;
        self.write = Some(writer);
        self.pings.clear();
        self.ping_timer.reset();
        self.reconnect_at = None;
        self.reconnect_passes = 0;

        for frame in self.registry.resubscribe_frames() {
            if !self.send_frame(&frame).await {
                return Err(Error::Connection(ConnectionError::NotConnected));
            }
        }
        let buffered: Vec<Bytes> = self.buffered.drain(..).collect();
        for frame in &buffered {
            if !self.send_frame(frame).await {
                return Err(Error::Connection(ConnectionError::NotConnected));
            }
            self.shared.stats.add_out(1, 0);
        }
        self.shared.stats.clear_buffered();

        self.shared.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.shared.state.set(ConnectionState::Connected);
        self.ever_connected = true;
        if reconnect {
            self.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tracing::info!(server = %server, "reconnected");
            self.shared.events.emit(Event::Reconnected { server });
        } else {
            tracing::info!(server = %server, "connected");
            self.shared.events.emit(Event::Connected);
        }
        Ok(())
    }

    fn finish_close(&mut self) {
        self.shared.state.set(ConnectionState::Closed);
        self.write = None;
        self.registry.clear();
        self.shared.requests.clear();
        self.buffered.clear();
        self.shared.stats.clear_buffered();
        for slot in self.pings.drain(..) {
            match slot {
                PingSlot::KeepAlive => {}
                PingSlot::Flush(respond) | PingSlot::DrainBarrier(respond) => {
                    let _ = respond.send(Err(Error::Connection(ConnectionError::Closed)));
                }
            }
        }
        tracing::info!("connection closed");
        self.shared.events.emit(Event::Closed);
        self.shared.closed.notify_waiters();
    }
}

/// Sleep until the deadline, or forever when there is none
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}


/// Per-transport read task: decode frames and forward them with our epoch
async fn read_loop(
    epoch: u64,
    mut reader: OwnedReadHalf,
    mut parser: OpParser,
    tx: mpsc::Sender<(u64, ReadEvent)>,
    shared: Arc<Shared>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        loop {
            match parser.next_op() {
                Ok(Some(op)) => {
                    if tx.send((epoch, ReadEvent::Op(op))).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send((epoch, ReadEvent::Failed(e.into()))).await;
                    return;
                }
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send((epoch, ReadEvent::Eof)).await;
                return;
            }
            Ok(n) => {
                shared.stats.add_in(0, n as u64);
                parser.extend(&buf[..n]);
            }
            Err(e) => {
                let _ = tx.send((epoch, ReadEvent::Failed(e.into()))).await;
                return;
            }
        }
    }
}

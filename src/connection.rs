//! Connection engine: lifecycle, demultiplexing, and the public handles.
//!
//! One session owns one duplex stream. A single background demux task is the
//! sole reader: it parses frames, decodes them, and fans the results onto the
//! per-kind delivery paths. Command replies and api responses share one
//! synchronous path (the pending-reply slot); asynchronous events flow
//! through a bounded channel with backpressure; fatal errors are delivered
//! once and connection closure is broadcast through a status watch.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::command::{encode_command, Msg};
use crate::constants::{
    AUTH_ACCEPTED_REPLY, CONTENT_TYPE_AUTH_REQUEST, DEFAULT_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::headers::EventHeader;
use crate::protocol::{decode_frame, Decoded, Frame, FrameParser};

/// Whether the session is still alive.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// The demux task is running.
    Connected,
    /// The session ended; no further events or replies will arrive.
    Disconnected(DisconnectReason),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean EOF on the stream.
    ConnectionClosed,
    /// TCP read/write failure (io::Error is not Clone, so the message is kept).
    IoError(String),
    /// Fatal framing/decode failure; the stream could no longer be trusted.
    ProtocolError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

/// Parameters fixed at connection time.
///
/// These replace what would otherwise be crate-level globals; pass them to
/// [`Connection::connect_with_options`] / [`Connection::accept_with_options`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Capacity of the async-event channel. Small by default: a full queue
    /// backpressures the demux task (stalling frame parsing for the whole
    /// connection) rather than dropping or reordering events.
    pub event_queue_size: usize,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            read_buffer_size: SOCKET_BUF_SIZE,
        }
    }
}

/// State shared between the command handle and the demux task.
struct SharedState {
    /// The one outstanding synchronous request, if any. Command replies and
    /// api responses both resolve this slot.
    pending_reply: Mutex<Option<oneshot::Sender<Result<Event>>>>,
}

/// Command handle for one session (`Clone + Send`).
///
/// Commands are written directly to the stream; the writer lock is held
/// through the reply, so concurrent callers are serialized and at most one
/// synchronous request is outstanding at a time.
#[derive(Clone)]
pub struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    remote_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receiver for asynchronous events (not `Clone`).
///
/// Events are delivered in arrival order as `Result<Event, Error>`; a fatal
/// connection error may surface here (once) if no command was waiting for it.
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event>>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Read one raw frame, pulling from the socket as needed. Used by the client
/// handshake, which runs before the stream is split and the demux task exists.
async fn read_frame(
    stream: &mut TcpStream,
    parser: &mut FrameParser,
    read_buffer: &mut [u8],
) -> Result<Frame> {
    loop {
        if let Some(frame) = parser.parse_frame()? {
            return Ok(frame);
        }
        let n = stream.read(read_buffer).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// Inbound-mode authentication: `auth/request` banner, `auth <secret>`,
/// `+OK accepted`.
async fn authenticate(
    stream: &mut TcpStream,
    parser: &mut FrameParser,
    read_buffer: &mut [u8],
    password: &str,
) -> Result<()> {
    debug!("waiting for auth/request banner");
    let banner = read_frame(stream, parser, read_buffer).await?;
    let content_type = banner
        .headers
        .get(EventHeader::ContentType.as_str())
        .map(|v| v.as_str())
        .unwrap_or("");
    if content_type != CONTENT_TYPE_AUTH_REQUEST {
        return Err(Error::handshake(format!(
            "expected auth/request banner, got {content_type:?}"
        )));
    }

    let wire = encode_command(&format!("auth {password}"))?;
    debug!("sending command: auth [REDACTED]");
    stream.write_all(wire.as_bytes()).await?;

    let reply = read_frame(stream, parser, read_buffer).await?;
    let reply_text = reply
        .headers
        .get(EventHeader::ReplyText.as_str())
        .map(|v| v.as_str())
        .unwrap_or("");
    if reply_text != AUTH_ACCEPTED_REPLY {
        return Err(Error::AuthRejected {
            reply_text: reply_text.to_string(),
        });
    }
    debug!("authentication successful");
    Ok(())
}

fn disconnect_reason(err: &Error) -> DisconnectReason {
    match err {
        Error::ConnectionClosed => DisconnectReason::ConnectionClosed,
        Error::Io(e) => DisconnectReason::IoError(e.to_string()),
        other => DisconnectReason::ProtocolError(other.to_string()),
    }
}

/// Resolve the pending synchronous waiter with a reply or a recoverable
/// error. Returns the value back if nobody was waiting.
async fn resolve_pending(shared: &SharedState, result: Result<Event>) -> Option<Result<Event>> {
    let mut pending = shared.pending_reply.lock().await;
    match pending.take() {
        Some(tx) => {
            // A dropped receiver means the sender gave up; nothing to do.
            let _ = tx.send(result);
            None
        }
        None => Some(result),
    }
}

/// Deliver a fatal error at most once: to the blocked command waiter if
/// there is one, otherwise (best effort) onto the event channel. Closure is
/// then broadcast through the status watch, which is the signal callers can
/// rely on.
async fn shutdown(
    shared: &SharedState,
    status_tx: &watch::Sender<ConnectionStatus>,
    event_tx: &mpsc::Sender<Result<Event>>,
    err: Error,
) {
    let reason = disconnect_reason(&err);
    if let Some(undelivered) = resolve_pending(shared, Err(err)).await {
        let _ = event_tx.try_send(undelivered);
    }
    let _ = status_tx.send(ConnectionStatus::Disconnected(reason));
}

/// Background demux task: guards the inner loop against panics so the status
/// watch always flips on the way out.
async fn demux_loop(
    reader: OwnedReadHalf,
    parser: FrameParser,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<Result<Event>>,
    read_buffer_size: usize,
) {
    let inner = std::panic::AssertUnwindSafe(demux_loop_inner(
        reader,
        parser,
        shared,
        status_tx.clone(),
        event_tx,
        read_buffer_size,
    ));
    if futures_util::FutureExt::catch_unwind(inner).await.is_err() {
        tracing::error!("demux task panicked");
        let _ = status_tx.send(ConnectionStatus::Disconnected(
            DisconnectReason::ProtocolError("demux task panicked".to_string()),
        ));
    }
}

async fn demux_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: FrameParser,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<Result<Event>>,
    read_buffer_size: usize,
) {
    let mut read_buffer = vec![0u8; read_buffer_size];

    loop {
        // Drain complete frames from buffered data before touching the socket.
        match parser.parse_frame() {
            Ok(Some(frame)) => {
                match decode_frame(frame) {
                    Ok(Decoded::Sync(event)) => {
                        trace!("routing synchronous reply");
                        if resolve_pending(&shared, Ok(event)).await.is_some() {
                            warn!("received command/api reply with no pending command");
                        }
                    }
                    Ok(Decoded::Async(event)) => {
                        trace!(event_name = event.event_name().unwrap_or(""), "routing event");
                        // Backpressure: a full queue stalls frame parsing for
                        // the whole connection until the consumer drains it.
                        if event_tx.send(Ok(event)).await.is_err() {
                            debug!("event stream dropped, demux exiting");
                            return;
                        }
                    }
                    Err(err) if !err.is_fatal() => {
                        // A -ERR reply belongs to the caller that triggered it.
                        if let Some(Err(unclaimed)) = resolve_pending(&shared, Err(err)).await {
                            warn!(error = %unclaimed, "protocol error with no pending command");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "fatal decode error");
                        shutdown(&shared, &status_tx, &event_tx, err).await;
                        return;
                    }
                }
                continue;
            }
            Ok(None) => {} // need more bytes
            Err(err) => {
                warn!(error = %err, "framing error");
                shutdown(&shared, &status_tx, &event_tx, err).await;
                return;
            }
        }

        match reader.read(&mut read_buffer).await {
            Ok(0) => {
                info!("connection closed (EOF)");
                shutdown(&shared, &status_tx, &event_tx, Error::ConnectionClosed).await;
                return;
            }
            Ok(n) => {
                if let Err(err) = parser.add_data(&read_buffer[..n]) {
                    warn!(error = %err, "parse buffer overflow");
                    shutdown(&shared, &status_tx, &event_tx, err).await;
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "read error");
                shutdown(&shared, &status_tx, &event_tx, Error::Io(e)).await;
                return;
            }
        }
    }
}

impl Connection {
    /// Inbound mode: dial the switch, authenticate, and start the demux task.
    ///
    /// Any failure before the handshake completes — including the stream
    /// closing mid-handshake — returns an error and no handles.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        password: &str,
    ) -> Result<(Connection, EventStream)> {
        Self::connect_with_options(addr, password, ConnectOptions::default()).await
    }

    /// [`connect`](Self::connect) with explicit buffer/queue sizing.
    pub async fn connect_with_options(
        addr: impl ToSocketAddrs,
        password: &str,
        options: ConnectOptions,
    ) -> Result<(Connection, EventStream)> {
        let mut stream = TcpStream::connect(addr).await?;
        info!(addr = ?stream.peer_addr().ok(), "connected to switch");

        let mut parser = FrameParser::new();
        let mut read_buffer = vec![0u8; options.read_buffer_size];
        authenticate(&mut stream, &mut parser, &mut read_buffer, password).await?;

        Ok(split_and_spawn(stream, parser, options))
    }

    /// Outbound mode: accept one connection from the switch and start the
    /// demux task immediately (no handshake — the switch is the dialer).
    ///
    /// The first command on an outbound session is conventionally
    /// `send("connect")`, whose reply carries the call's channel data.
    pub async fn accept(listener: &TcpListener) -> Result<(Connection, EventStream)> {
        Self::accept_with_options(listener, ConnectOptions::default()).await
    }

    /// [`accept`](Self::accept) with explicit buffer/queue sizing.
    pub async fn accept_with_options(
        listener: &TcpListener,
        options: ConnectOptions,
    ) -> Result<(Connection, EventStream)> {
        let (stream, addr) = listener.accept().await?;
        info!(%addr, "accepted connection from switch");
        Ok(split_and_spawn(stream, FrameParser::new(), options))
    }

    /// Send a bare command and wait for the next synchronous reply
    /// (command/reply or api/response, whichever the switch answers with).
    ///
    /// A command containing raw CR or LF is rejected before any bytes are
    /// written. A `-ERR` reply surfaces as [`Error::Protocol`]; the
    /// connection stays usable afterwards. There is no built-in timeout —
    /// wrap the call in [`tokio::time::timeout`] if one is wanted.
    pub async fn send(&self, command: &str) -> Result<Event> {
        let wire = encode_command(command)?;
        debug!(command = %command, "sending command");
        self.send_wire(&wire).await
    }

    /// Send a `sendmsg` block and wait for the reply.
    pub async fn sendmsg(&self, msg: Msg) -> Result<Event> {
        let wire = msg.to_wire()?;
        debug!("sending sendmsg block");
        self.send_wire(&wire).await
    }

    /// Execute a dialplan application on the attached call (outbound mode).
    ///
    /// `lock` serializes the application behind previously queued ones by
    /// setting `event-lock: true`; when false the field is omitted entirely.
    pub async fn execute(&self, app_name: &str, app_arg: &str, lock: bool) -> Result<Event> {
        self.sendmsg(Msg::execute(app_name, app_arg, lock)).await
    }

    /// Execute a dialplan application on a specific call leg by UUID
    /// (inbound mode, where several calls share one connection).
    pub async fn execute_uuid(&self, uuid: &str, app_name: &str, app_arg: &str) -> Result<Event> {
        self.sendmsg(Msg::execute(app_name, app_arg, false).uuid(uuid))
            .await
    }

    /// Write pre-encoded bytes and block for the correlated reply.
    ///
    /// The writer lock is held through the whole send-and-await cycle: the
    /// protocol is strictly request/reply, so this both serializes
    /// concurrent senders and guarantees the pending-reply slot holds at
    /// most one waiter.
    async fn send_wire(&self, wire: &str) -> Result<Event> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending_reply.lock().await;
            *pending = Some(tx);
        }

        if let Err(e) = writer.write_all(wire.as_bytes()).await {
            // Nothing is coming back for this request; clear the slot.
            self.shared.pending_reply.lock().await.take();
            return Err(Error::Io(e));
        }

        // The demux task resolves the one fatal error to whichever slot is
        // registered when it shuts down; a sender that registered after that
        // point would wait forever. Racing the reply against the status watch
        // lets every sender observe closure.
        let mut status_rx = self.status_rx.clone();
        let disconnected = async move {
            loop {
                if matches!(
                    *status_rx.borrow_and_update(),
                    ConnectionStatus::Disconnected(_)
                ) {
                    return;
                }
                if status_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result,
                // Demux exited without resolving the slot.
                Err(_) => Err(Error::ConnectionClosed),
            },
            _ = disconnected => {
                // Shutdown resolves the pending slot before flipping the
                // watch; take whatever landed there, else report closure.
                self.shared.pending_reply.lock().await.take();
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectionClosed),
                }
            }
        }
    }

    /// Remote peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the demux task is still running.
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait until the session is disconnected, returning the reason.
    ///
    /// Closure is broadcast: every clone of the handle (and the event
    /// stream) can observe it independently of who received the one fatal
    /// error delivery.
    pub async fn closed(&self) -> DisconnectReason {
        let mut status_rx = self.status_rx.clone();
        loop {
            if let ConnectionStatus::Disconnected(reason) = &*status_rx.borrow_and_update() {
                return reason.clone();
            }
            if status_rx.changed().await.is_err() {
                return DisconnectReason::ConnectionClosed;
            }
        }
    }

    /// Tear the session down by shutting the write half; the demux task
    /// observes the closure and notifies all waiters.
    pub async fn close(&self) -> Result<()> {
        info!("closing connection");
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl EventStream {
    /// Next asynchronous event, in arrival order; `None` once the session is
    /// gone and the final error (if any) has been consumed.
    ///
    /// The fatal error ending a session surfaces here only when no command
    /// was waiting for it and the queue had room; a stream may simply end
    /// without one. [`status`](Self::status) is the authoritative closure
    /// signal.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        self.rx.recv().await
    }

    /// Whether the demux task is still running.
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }
}

impl futures_util::Stream for EventStream {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn split_and_spawn(
    stream: TcpStream,
    parser: FrameParser,
    options: ConnectOptions,
) -> (Connection, EventStream) {
    let remote_addr = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();

    let shared = Arc::new(SharedState {
        pending_reply: Mutex::new(None),
    });
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
    let status_rx2 = status_tx.subscribe();
    let (event_tx, event_rx) = mpsc::channel(options.event_queue_size.max(1));

    tokio::spawn(demux_loop(
        read_half,
        parser,
        shared.clone(),
        status_tx,
        event_tx,
        options.read_buffer_size.max(1),
    ));

    let connection = Connection {
        writer: Arc::new(Mutex::new(write_half)),
        shared,
        status_rx,
        remote_addr,
    };
    let events = EventStream {
        rx: event_rx,
        status_rx: status_rx2,
    };
    (connection, events)
}

/// Outbound mode server loop: bind, accept connections from the switch, and
/// spawn one `handler` invocation per accepted connection.
///
/// ```rust,no_run
/// use eventsocket::{listen_and_serve, Connection, EventStream};
///
/// #[tokio::main]
/// async fn main() -> Result<(), eventsocket::Error> {
///     listen_and_serve("0.0.0.0:9090", |conn: Connection, _events: EventStream| async move {
///         let _ = conn.send("connect").await;
///         let _ = conn.execute("answer", "", false).await;
///     })
///     .await
/// }
/// ```
pub async fn listen_and_serve<A, F, Fut>(addr: A, mut handler: F) -> Result<()>
where
    A: ToSocketAddrs,
    F: FnMut(Connection, EventStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = ?listener.local_addr().ok(), "listening for switch connections");
    loop {
        let (connection, events) = Connection::accept(&listener).await?;
        tokio::spawn(handler(connection, events));
    }
}

//! Connection state machine and session handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::constants::{
    CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_DISCONNECT_NOTICE, HEADER_CONTENT_TYPE,
    HEADER_TERMINATOR, SOCKET_BUF_SIZE,
};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind, ReplyStatus};
use crate::parser::FrameParser;
use crate::reply::ReplyQueue;
use crate::router::EventRouter;
use crate::supervisor::Config;

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// This side opens the connection to the switch and authenticates.
    DialOut,
    /// The switch opens the connection to this side, one socket per call;
    /// this side sends `connect` first to receive the call's context.
    DialIn,
}

/// Session lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionState {
    /// Socket established, no frames exchanged yet.
    Connecting,
    /// Dial-out only: auth challenge received, credentials sent.
    Authenticating,
    /// Frames are being dispatched; commands are accepted.
    Ready,
    /// Teardown in progress; no new commands accepted.
    Closing,
    /// Terminal.
    Closed(DisconnectReason),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The switch sent a disconnect notice.
    ServerNotice,
    /// Clean EOF from the peer.
    PeerClosed,
    /// Unrecoverable framing error; the stream cannot be resynchronized.
    ProtocolError(String),
    /// TCP I/O error (io::Error is not Clone, so the message is kept).
    IoError(String),
    /// The application closed the session.
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "switch sent disconnect notice"),
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested close"),
        }
    }
}

/// State shared between the session handle and the reader task.
struct Shared {
    replies: ReplyQueue,
    router: Arc<EventRouter>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    /// Drive the session to `Closed`, failing every outstanding command
    /// waiter in FIFO order. The first teardown wins; later calls are
    /// no-ops so a racing reader exit cannot overwrite the reason.
    fn teardown(&self, reason: DisconnectReason) {
        let entered = self.state_tx.send_if_modified(|state| {
            if matches!(state, SessionState::Closing | SessionState::Closed(_)) {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !entered {
            return;
        }
        self.replies.fail_all();
        self.state_tx.send_replace(SessionState::Closed(reason));
    }
}

/// Handle to one live event socket session (Clone + Send).
///
/// Commands are enqueued and written under the writer lock, so wire order
/// always equals waiter-queue order; the background reader task resolves
/// each waiter with the reply at its position in send order and routes
/// event frames to the [`EventRouter`] instead.
#[derive(Clone)]
pub struct EventSocket {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    mode: SocketMode,
    context: Option<Arc<Frame>>,
}

impl fmt::Debug for EventSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSocket")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Validate that a user-provided string contains no newline characters.
///
/// Commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> Result<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(Error::protocol(format!(
            "{context} must not contain newlines"
        )));
    }
    Ok(())
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, timeout_ms: u64) -> Result<TcpStream> {
    match timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            debug!("TCP connection established");
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "TCP connect failed");
            Err(Error::Io(e))
        }
        Err(_) => {
            warn!(timeout_ms, "TCP connect timed out");
            Err(Error::Timeout { timeout_ms })
        }
    }
}

/// Read one frame from the unsplit stream during the handshake.
async fn recv_frame(
    stream: &mut TcpStream,
    parser: &mut FrameParser,
    read_buffer: &mut [u8],
    timeout_ms: u64,
) -> Result<Frame> {
    loop {
        if let Some(frame) = parser.next_frame()? {
            trace!(kind = ?frame.kind(), "handshake frame");
            return Ok(frame);
        }

        let read = timeout(Duration::from_millis(timeout_ms), stream.read(read_buffer)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::Timeout { timeout_ms }),
        };
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        parser.feed(&read_buffer[..n])?;
    }
}

async fn send_raw(stream: &mut TcpStream, text: &str) -> Result<()> {
    stream.write_all(text.as_bytes()).await.map_err(Error::Io)
}

impl EventSocket {
    /// Open a dial-out session: connect to the switch, authenticate, and
    /// (unless disabled in the config) subscribe to events.
    pub async fn dial_out(config: &Config, router: Arc<EventRouter>) -> Result<Self> {
        let timeout_ms = config.connect_timeout.as_millis() as u64;
        info!(host = %config.host, port = config.port, "dialing switch");
        let mut stream = tcp_connect_with_timeout(&config.host, config.port, timeout_ms).await?;

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let mut parser = FrameParser::new();
        let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

        let challenge = recv_frame(&mut stream, &mut parser, &mut read_buffer, timeout_ms).await?;
        if challenge.header(HEADER_CONTENT_TYPE) != Some(CONTENT_TYPE_AUTH_REQUEST) {
            return Err(Error::protocol(
                "expected auth challenge as first frame in dial-out mode",
            ));
        }
        state_tx.send_replace(SessionState::Authenticating);

        let password = config.password.as_deref().unwrap_or_default();
        debug!("sending command: auth [REDACTED]");
        send_raw(&mut stream, &format!("auth {password}{HEADER_TERMINATOR}")).await?;

        let reply = recv_frame(&mut stream, &mut parser, &mut read_buffer, timeout_ms).await?;
        if reply.reply_status() != ReplyStatus::Ok {
            state_tx.send_replace(SessionState::Closing);
            let reason = reply
                .reply_text()
                .unwrap_or("authentication rejected")
                .to_string();
            return Err(Error::AuthenticationFailed { reason });
        }

        if let Some(events) = &config.subscribe {
            debug!(events = %events, "subscribing to events");
            send_raw(
                &mut stream,
                &format!("event plain {events}{HEADER_TERMINATOR}"),
            )
            .await?;
            let reply = recv_frame(&mut stream, &mut parser, &mut read_buffer, timeout_ms).await?;
            if reply.reply_status() != ReplyStatus::Ok {
                warn!(reply = ?reply.reply_text(), "event subscription rejected");
            }
        }

        info!("authenticated and ready");
        Ok(Self::split_and_spawn(
            stream,
            parser,
            state_tx,
            state_rx,
            router,
            SocketMode::DialOut,
            None,
        ))
    }

    /// Initialize a dial-in session on an accepted socket: send `connect`
    /// before anything else, keep the reply's channel context, and (unless
    /// disabled) subscribe to the session's events with `myevents`.
    pub async fn dial_in(
        mut stream: TcpStream,
        config: &Config,
        router: Arc<EventRouter>,
    ) -> Result<Self> {
        let timeout_ms = config.connect_timeout.as_millis() as u64;
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let mut parser = FrameParser::new();
        let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

        debug!("sending command: connect");
        send_raw(&mut stream, &format!("connect{HEADER_TERMINATOR}")).await?;
        let context = recv_frame(&mut stream, &mut parser, &mut read_buffer, timeout_ms).await?;
        if context.kind() != FrameKind::CommandReply {
            return Err(Error::protocol("expected command/reply to connect"));
        }

        if config.subscribe.is_some() {
            debug!("sending command: myevents plain");
            send_raw(&mut stream, &format!("myevents plain{HEADER_TERMINATOR}")).await?;
            let reply = recv_frame(&mut stream, &mut parser, &mut read_buffer, timeout_ms).await?;
            if reply.reply_status() != ReplyStatus::Ok {
                warn!(reply = ?reply.reply_text(), "myevents subscription rejected");
            }
        }

        info!(channel = ?context.header("channel_name"), "dial-in session ready");
        Ok(Self::split_and_spawn(
            stream,
            parser,
            state_tx,
            state_rx,
            router,
            SocketMode::DialIn,
            Some(Arc::new(context)),
        ))
    }

    fn split_and_spawn(
        stream: TcpStream,
        parser: FrameParser,
        state_tx: watch::Sender<SessionState>,
        state_rx: watch::Receiver<SessionState>,
        router: Arc<EventRouter>,
        mode: SocketMode,
        context: Option<Arc<Frame>>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        state_tx.send_replace(SessionState::Ready);

        let shared = Arc::new(Shared {
            replies: ReplyQueue::new(),
            router,
            state_tx,
        });
        tokio::spawn(reader_loop(read_half, parser, Arc::clone(&shared)));

        EventSocket {
            writer: Arc::new(Mutex::new(write_half)),
            shared,
            state_rx,
            mode,
            context,
        }
    }

    /// Send a raw command and suspend until its positionally-correlated
    /// reply arrives.
    ///
    /// The command text is written verbatim plus the frame terminator; it
    /// must not contain newlines. The waiter is enqueued and the bytes are
    /// written under the writer lock, so wire order equals queue order even
    /// when several tasks pipeline commands concurrently. The suspended
    /// caller is resumed by the reader task with the reply at its position
    /// in send order, or with [`Error::ConnectionClosed`] on teardown.
    ///
    /// No deadline is applied here; callers that need one can wrap this in
    /// `tokio::time::timeout`.
    pub async fn send_command(&self, text: &str) -> Result<Frame> {
        validate_no_newlines(text, "command")?;
        if !self.is_ready() {
            return Err(Error::ConnectionClosed);
        }
        debug!(command = %text, "sending command");

        let rx = {
            let mut writer = self.writer.lock().await;
            let rx = self.shared.replies.register()?;
            let wire = format!("{text}{HEADER_TERMINATOR}");
            writer.write_all(wire.as_bytes()).await.map_err(Error::Io)?;
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Execute an API command (`api <command>`). The switch blocks the
    /// socket until the command completes.
    pub async fn api(&self, command: &str) -> Result<Frame> {
        self.send_command(&format!("api {command}")).await
    }

    /// Execute a background API command (`bgapi <command>`). The reply
    /// acknowledges the job; the result arrives later as a
    /// `BACKGROUND_JOB` event.
    pub async fn bgapi(&self, command: &str) -> Result<Frame> {
        self.send_command(&format!("bgapi {command}")).await
    }

    /// Subscribe to additional events (`event plain <list>`).
    pub async fn subscribe_events(&self, events: &str) -> Result<Frame> {
        self.send_command(&format!("event plain {events}")).await
    }

    /// Connection role of this session.
    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    /// Channel context received from the `connect` handshake. `None` for
    /// dial-out sessions.
    pub fn context(&self) -> Option<&Frame> {
        self.context.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Whether the session accepts commands.
    pub fn is_ready(&self) -> bool {
        matches!(*self.state_rx.borrow(), SessionState::Ready)
    }

    /// Wait until the session reaches `Closed` and return the reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.state_rx.clone();
        loop {
            if let SessionState::Closed(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return DisconnectReason::ClientRequested;
            }
        }
    }

    /// Close the session: fail every outstanding command waiter and shut
    /// the socket down.
    pub async fn close(&self) {
        info!("client requested close");
        self.shared.teardown(DisconnectReason::ClientRequested);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "socket shutdown failed");
        }
    }
}

/// Background reader task: shields the inner loop so a panic still tears
/// the session down instead of leaving waiters suspended forever.
async fn reader_loop(reader: OwnedReadHalf, parser: FrameParser, shared: Arc<Shared>) {
    let inner = std::panic::AssertUnwindSafe(reader_loop_inner(reader, parser, Arc::clone(&shared)));
    if futures_util::FutureExt::catch_unwind(inner).await.is_err() {
        tracing::error!("reader task panicked");
        shared.teardown(DisconnectReason::IoError("reader task panicked".to_string()));
    }
}

async fn reader_loop_inner(mut reader: OwnedReadHalf, mut parser: FrameParser, shared: Arc<Shared>) {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain buffered frames before touching the socket again.
        match parser.next_frame() {
            Ok(Some(frame)) => {
                if route_frame(frame, &shared) == Routing::Stop {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "frame parse failed, tearing down");
                shared.teardown(DisconnectReason::ProtocolError(e.to_string()));
                return;
            }
        }

        match reader.read(&mut read_buffer).await {
            Ok(0) => {
                info!("peer closed the connection");
                shared.teardown(DisconnectReason::PeerClosed);
                return;
            }
            Ok(n) => {
                if let Err(e) = parser.feed(&read_buffer[..n]) {
                    warn!(error = %e, "inbound buffer overflow, tearing down");
                    shared.teardown(DisconnectReason::ProtocolError(e.to_string()));
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "socket read failed");
                shared.teardown(DisconnectReason::IoError(e.to_string()));
                return;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Routing {
    Continue,
    Stop,
}

/// Classify one frame and hand it to the correlator, the router, or the
/// state machine.
fn route_frame(frame: Frame, shared: &Shared) -> Routing {
    match frame.kind() {
        FrameKind::Event => {
            shared.router.dispatch(&frame);
            Routing::Continue
        }
        FrameKind::ApiResponse | FrameKind::CommandReply => {
            if !shared.replies.resolve(frame) {
                warn!("reply frame with no outstanding command, dropping");
            }
            Routing::Continue
        }
        FrameKind::Other => match frame.header(HEADER_CONTENT_TYPE) {
            Some(CONTENT_TYPE_DISCONNECT_NOTICE) => {
                info!("received disconnect notice");
                shared.teardown(DisconnectReason::ServerNotice);
                Routing::Stop
            }
            other => {
                debug!(content_type = ?other, "ignoring unclassified frame");
                Routing::Continue
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeaderMap;
    use std::sync::Mutex as StdMutex;

    fn shared_with_router(router: Arc<EventRouter>) -> (Arc<Shared>, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Ready);
        let shared = Arc::new(Shared {
            replies: ReplyQueue::new(),
            router,
            state_tx,
        });
        (shared, state_rx)
    }

    fn frame(headers: &[(&str, &str)], content: &str) -> Frame {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name, *value);
        }
        Frame::new(map, content.to_string())
    }

    #[tokio::test]
    async fn test_reply_frame_resolves_oldest_waiter() {
        let (shared, _state_rx) = shared_with_router(Arc::new(EventRouter::new()));
        let rx = shared.replies.register().unwrap();

        let reply = frame(
            &[("Content-Type", "command/reply"), ("Reply-Text", "+OK")],
            "",
        );
        assert_eq!(route_frame(reply, &shared), Routing::Continue);
        assert_eq!(rx.await.unwrap().unwrap().reply_text(), Some("+OK"));
    }

    #[tokio::test]
    async fn test_unsolicited_reply_does_not_stop_routing() {
        let (shared, _state_rx) = shared_with_router(Arc::new(EventRouter::new()));
        let reply = frame(&[("Content-Type", "command/reply")], "");
        assert_eq!(route_frame(reply, &shared), Routing::Continue);
    }

    #[tokio::test]
    async fn test_event_frame_goes_to_router_not_correlator() {
        let router = Arc::new(EventRouter::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        router.subscribe("CHANNEL_ANSWER", move |f| {
            seen2.lock().unwrap().push(f.event_name().unwrap().to_string());
            Ok(())
        });

        let (shared, _state_rx) = shared_with_router(router);
        let rx = shared.replies.register().unwrap();

        let event = frame(
            &[("Content-Type", "text/event-plain")],
            "Event-Name: CHANNEL_ANSWER\n",
        );
        assert_eq!(route_frame(event, &shared), Routing::Continue);
        assert_eq!(*seen.lock().unwrap(), vec!["CHANNEL_ANSWER"]);

        // The waiter is still pending: the event was never treated as a reply.
        assert_eq!(shared.replies.pending(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn test_disconnect_notice_tears_down() {
        let (shared, state_rx) = shared_with_router(Arc::new(EventRouter::new()));
        let rx = shared.replies.register().unwrap();

        let notice = frame(&[("Content-Type", "text/disconnect-notice")], "");
        assert_eq!(route_frame(notice, &shared), Routing::Stop);
        assert_eq!(
            *state_rx.borrow(),
            SessionState::Closed(DisconnectReason::ServerNotice)
        );
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (shared, state_rx) = shared_with_router(Arc::new(EventRouter::new()));
        shared.teardown(DisconnectReason::PeerClosed);
        shared.teardown(DisconnectReason::ClientRequested);
        assert_eq!(
            *state_rx.borrow(),
            SessionState::Closed(DisconnectReason::PeerClosed)
        );
    }

    #[test]
    fn test_validate_no_newlines() {
        assert!(validate_no_newlines("api status", "command").is_ok());
        assert!(validate_no_newlines("api status\n\nevent plain ALL", "command").is_err());
        assert!(validate_no_newlines("api\rstatus", "command").is_err());
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::ServerNotice.to_string(),
            "switch sent disconnect notice"
        );
        assert_eq!(
            DisconnectReason::ProtocolError("bad frame".into()).to_string(),
            "protocol error: bad frame"
        );
    }
}

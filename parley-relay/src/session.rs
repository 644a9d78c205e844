//! Client sessions: one per accepted TCP connection.
//!
//! A [`Session`] is created by [`Session::open`], which reads the identity
//! frame. [`Session::run`] then splits the connection into a receive loop and
//! a write task. Other tasks talk to a running session only through its
//! cloneable [`SessionHandle`]: [`SessionHandle::send`] queues a frame for the
//! single writer, and [`SessionHandle::close`] asks both halves to stop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_proto::codec::{self, CodecError, LENGTH_PREFIX_LEN};
use parley_proto::frame::{Frame, FrameKind, MEMBERSHIP_SEPARATOR};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::config::RelayConfig;
use crate::registry::Registration;
use crate::relay::EngineEvent;

/// Maximum identity length in characters.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Largest identity frame body: tag, length prefix and a name of
/// [`MAX_IDENTITY_LEN`] four-byte characters.
pub const MAX_IDENTITY_FRAME_LEN: usize = 1 + LENGTH_PREFIX_LEN + MAX_IDENTITY_LEN * 4;

/// How long a closing session waits for its writer to flush queued frames.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Unique id of one session, distinguishing reconnects under the same name.
pub type SessionId = uuid::Uuid;

/// Per-connection resource limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Largest frame body accepted from the peer.
    pub max_frame_size: usize,
    /// Frames buffered for the peer before deliveries start failing.
    pub outbound_queue_size: usize,
    /// Time allowed for the identity frame to arrive.
    pub handshake_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        RelayConfig::default().session_limits()
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Identity received, not yet registered.
    Connecting,
    /// Registered and relaying.
    Active,
    /// Stopping: no new frames are read.
    Closing,
    /// Transport released and registry entry removed.
    Closed,
}

/// Errors while reading the identity frame of a new connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The peer closed the connection before sending an identity.
    #[error("connection closed before identity was received")]
    Closed,
    /// No identity arrived within the handshake timeout.
    #[error("no identity received within {0:?}")]
    Timeout(Duration),
    /// The first frame could not be decoded.
    #[error("malformed identity frame: {0}")]
    Malformed(#[from] CodecError),
    /// The first frame was not an identity frame.
    #[error("expected identity frame, got {0}")]
    UnexpectedFrame(FrameKind),
    /// The claimed identity is not acceptable.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    /// Underlying socket error.
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`read_frame`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The stream ended cleanly on a frame boundary.
    #[error("connection closed")]
    Closed,
    /// The bytes on the stream do not form a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),
    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`SessionHandle::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The peer is not draining its queue fast enough.
    #[error("outbound queue for {0} is full")]
    QueueFull(String),
    /// The session is shutting down or gone.
    #[error("session {0} is closed")]
    Closed(String),
}

/// Why a session's receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// The peer sent a malformed frame.
    Malformed(CodecError),
    /// Reading from the socket failed.
    ReadFailed(String),
    /// Writing to the socket failed.
    WriteFailed(String),
    /// [`SessionHandle::close`] was called.
    Requested,
    /// The relay engine is no longer accepting events.
    EngineStopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::ReadFailed(e) => write!(f, "read failed: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::Requested => write!(f, "closed by relay"),
            Self::EngineStopped => write!(f, "relay engine stopped"),
        }
    }
}

/// How a finished session left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    /// Why the receive loop stopped.
    pub reason: CloseReason,
    /// `false` if a newer session had already taken over the identity, so
    /// this session's exit removed nothing.
    pub released: bool,
}

/// Cloneable handle to a session, held by the registry and the engine.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    identity: Arc<str>,
    outbound: mpsc::Sender<Arc<Frame>>,
    shutdown: Arc<watch::Sender<bool>>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    fn new(identity: &str, queue_size: usize) -> (Self, mpsc::Receiver<Arc<Frame>>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        let handle = Self {
            id: uuid::Uuid::now_v7(),
            identity: Arc::from(identity),
            outbound,
            shutdown: Arc::new(shutdown),
            state: Arc::new(Mutex::new(SessionState::Connecting)),
        };
        (handle, outbound_rx)
    }

    /// Creates a handle with no socket behind it, for exercising routing.
    #[cfg(test)]
    pub(crate) fn detached(identity: &str, queue_size: usize) -> (Self, mpsc::Receiver<Arc<Frame>>) {
        Self::new(identity, queue_size)
    }

    /// Returns the unique id of this session.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the participant identity of this session.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Returns `true` once [`close`](Self::close) was called or the session ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Queues a frame for this session's writer.
    ///
    /// Never waits: a full queue is reported as a failed delivery. Frames
    /// queued on one session are written in order, one at a time.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QueueFull`] if the peer is too slow, or
    /// [`DeliveryError::Closed`] if the session is closing.
    pub fn send(&self, frame: impl Into<Arc<Frame>>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed(self.identity.to_string()));
        }
        self.outbound.try_send(frame.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull(self.identity.to_string()),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.identity.to_string()),
        })
    }

    /// Asks the session to stop. Safe to call any number of times.
    ///
    /// The receive loop returns, queued frames get a short grace period to be
    /// written, and the socket is shut down.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.advance(SessionState::Closing);
    }

    /// Moves the session forward to `next`; earlier states are ignored.
    pub(crate) fn advance(&self, next: SessionState) {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
        }
    }

    /// Returns `true` if both handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// One connection that has completed the identity handshake.
pub struct Session {
    handle: SessionHandle,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    outbound_rx: mpsc::Receiver<Arc<Frame>>,
    peer_addr: Option<SocketAddr>,
    limits: SessionLimits,
}

impl Session {
    /// Reads the identity frame from a freshly accepted connection.
    ///
    /// Exactly one frame is read, capped at [`MAX_IDENTITY_FRAME_LEN`] bytes
    /// regardless of the session's frame limit. On any failure the connection
    /// is dropped, which closes it.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if the peer closes, stalls past the
    /// handshake timeout, sends a malformed or non-identity frame, or claims
    /// an invalid identity.
    pub async fn open(stream: TcpStream, limits: SessionLimits) -> Result<Self, HandshakeError> {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first = tokio::time::timeout(
            limits.handshake_timeout,
            read_frame(&mut reader, limits.max_frame_size.min(MAX_IDENTITY_FRAME_LEN)),
        )
        .await
        .map_err(|_| HandshakeError::Timeout(limits.handshake_timeout))?;

        let frame = match first {
            Ok(frame) => frame,
            Err(ReadError::Closed) => return Err(HandshakeError::Closed),
            Err(ReadError::Malformed(e)) => return Err(HandshakeError::Malformed(e)),
            Err(ReadError::Io(e)) => return Err(HandshakeError::Io(e)),
        };
        let Frame::Identity { name } = frame else {
            return Err(HandshakeError::UnexpectedFrame(frame.kind()));
        };
        validate_identity(&name)?;

        let (handle, outbound_rx) = SessionHandle::new(&name, limits.outbound_queue_size);
        Ok(Self {
            handle,
            reader,
            writer,
            outbound_rx,
            peer_addr,
            limits,
        })
    }

    /// Returns this session's handle.
    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Returns the identity the peer claimed.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.handle.identity()
    }

    /// Returns the remote socket address, if known.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Sends an [`Frame::Error`] and closes the connection without running it.
    ///
    /// Used when the registry refuses the session.
    pub async fn reject(self, reason: String) {
        let Self {
            handle,
            mut writer,
            limits,
            ..
        } = self;
        handle.close();

        let frame = Frame::Error { reason };
        let flush = async {
            write_frame(&mut writer, &frame).await?;
            writer.shutdown().await
        };
        match tokio::time::timeout(limits.handshake_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(peer_id = %handle.identity(), error = %e, "failed to send rejection");
            }
            Err(_) => {
                tracing::debug!(peer_id = %handle.identity(), "timed out sending rejection");
            }
        }
        handle.advance(SessionState::Closed);
    }

    /// Runs the session until the peer leaves, misbehaves, or it is closed.
    ///
    /// Every decoded frame is forwarded to `events` together with this
    /// session's handle, in the order it arrived. On exit the writer is
    /// stopped, `registration` is released and [`EngineEvent::Left`] is
    /// sent.
    pub async fn run(
        self,
        registration: Registration,
        events: mpsc::Sender<EngineEvent>,
    ) -> SessionExit {
        let Self {
            handle,
            mut reader,
            writer,
            outbound_rx,
            limits,
            ..
        } = self;

        let mut shutdown_rx = handle.shutdown.subscribe();
        let mut write_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            handle.shutdown.subscribe(),
        ));
        let mut writer_done = false;

        let reason = loop {
            tokio::select! {
                biased;
                () = closed(&mut shutdown_rx) => break CloseReason::Requested,
                result = &mut write_task => {
                    writer_done = true;
                    break match result {
                        Ok(Ok(())) => CloseReason::Requested,
                        Ok(Err(e)) => CloseReason::WriteFailed(e.to_string()),
                        Err(e) => CloseReason::WriteFailed(e.to_string()),
                    };
                }
                result = read_frame(&mut reader, limits.max_frame_size) => match result {
                    Ok(frame) => {
                        let event = EngineEvent::Inbound { from: handle.clone(), frame };
                        if events.send(event).await.is_err() {
                            break CloseReason::EngineStopped;
                        }
                    }
                    Err(ReadError::Closed) => break CloseReason::PeerClosed,
                    Err(ReadError::Malformed(e)) => break CloseReason::Malformed(e),
                    Err(ReadError::Io(e)) => break CloseReason::ReadFailed(e.to_string()),
                },
            }
        };

        handle.close();
        if !writer_done
            && tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut write_task)
                .await
                .is_err()
        {
            tracing::debug!(peer_id = %handle.identity(), "writer did not drain in time, aborting");
            write_task.abort();
        }
        drop(reader);

        let released = registration.release();
        handle.advance(SessionState::Closed);

        let left = EngineEvent::Left {
            identity: handle.identity().to_string(),
            id: handle.id(),
            reason: reason.clone(),
            replaced: !released,
        };
        if events.send(left).await.is_err() {
            tracing::debug!(peer_id = %handle.identity(), "engine gone, leave not reported");
        }
        SessionExit { reason, released }
    }
}

/// Drains the outbound queue onto the socket until shutdown.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Arc<Frame>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(frame) => write_frame(&mut writer, &frame).await?,
                None => break,
            },
            () = closed(&mut shutdown) => break,
        }
    }
    // Anything queued before the close request still goes out.
    while let Ok(frame) = outbound.try_recv() {
        write_frame(&mut writer, &frame).await?;
    }
    writer.shutdown().await
}

/// Resolves once the close flag is set or its sender is gone.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Checks that a claimed identity can be registered and listed.
///
/// # Errors
///
/// Returns [`HandshakeError::InvalidIdentity`] for empty or overlong names and
/// names containing the membership separator or control characters.
pub fn validate_identity(name: &str) -> Result<(), HandshakeError> {
    if name.is_empty() {
        return Err(HandshakeError::InvalidIdentity(
            "identity must not be empty".into(),
        ));
    }
    if name.chars().count() > MAX_IDENTITY_LEN {
        return Err(HandshakeError::InvalidIdentity(format!(
            "identity longer than {MAX_IDENTITY_LEN} characters"
        )));
    }
    if name.contains(MEMBERSHIP_SEPARATOR) {
        return Err(HandshakeError::InvalidIdentity(format!(
            "identity must not contain '{MEMBERSHIP_SEPARATOR}'"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(HandshakeError::InvalidIdentity(
            "identity must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Reads exactly one length-prefixed frame from a stream.
///
/// The declared length is checked against `max_frame_size` before the body is
/// buffered. A stream that ends before the first header byte is
/// [`ReadError::Closed`]; one that ends mid-frame is a truncated frame.
///
/// # Errors
///
/// Returns [`ReadError`] on end of stream, malformed input, or socket failure.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(ReadError::Closed);
    }
    if got < LENGTH_PREFIX_LEN {
        return Err(CodecError::Truncated {
            needed: LENGTH_PREFIX_LEN,
            available: got,
        }
        .into());
    }

    let len = codec::frame_len(header, max_frame_size)?;
    let mut body = vec![0u8; len];
    let got = read_full(reader, &mut body).await?;
    if got < len {
        return Err(CodecError::Truncated {
            needed: len,
            available: got,
        }
        .into());
    }
    Ok(codec::decode(&body)?)
}

/// Encodes and writes one frame, then flushes.
///
/// # Errors
///
/// Returns an I/O error if the frame cannot be encoded or written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode_framed(frame).map_err(std::io::Error::other)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Fills `buf` from the stream, returning how many bytes arrived before EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

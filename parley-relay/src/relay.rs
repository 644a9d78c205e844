//! Core relay logic: accept loop, per-connection tasks and frame dispatch.
//!
//! Each accepted connection gets its own task which performs the identity
//! handshake, registers the session and runs it. Sessions never route frames
//! themselves: everything they read is sent to a single dispatch task as an
//! [`EngineEvent`], and the dispatch task queues the resulting frames on the
//! recipients' [`SessionHandle`]s without ever touching a socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parley_proto::Frame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::config::RelayConfig;
use crate::events::{EVENT_CHANNEL_CAPACITY, PayloadSummary, RelayEvent};
use crate::registry::{ClientRegistry, DuplicatePolicy};
use crate::session::{CloseReason, Session, SessionHandle, SessionId, SessionLimits};

/// Capacity of the channel from sessions to the dispatch task.
const ENGINE_QUEUE_SIZE: usize = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What sessions report to the dispatch task.
#[derive(Debug)]
pub enum EngineEvent {
    /// A session was registered and is ready to receive frames.
    Joined(SessionHandle),
    /// A session read a frame from its peer.
    Inbound {
        /// The session the frame arrived on.
        from: SessionHandle,
        /// The decoded frame.
        frame: Frame,
    },
    /// A session ended and released its registry entry.
    Left {
        /// Identity the session was registered under.
        identity: String,
        /// Id of the ended session.
        id: SessionId,
        /// Why it ended.
        reason: CloseReason,
        /// A newer session took over the identity before this one ended.
        replaced: bool,
    },
}

/// Shared relay server state: the client registry, limits and observers.
pub struct RelayState {
    registry: ClientRegistry,
    limits: SessionLimits,
    max_connections: usize,
    connections: AtomicUsize,
    events: broadcast::Sender<RelayEvent>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with the [`RelayConfig`] defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    /// Creates a relay state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self::with_limits(
            config.session_limits(),
            config.max_connections,
            config.duplicate_policy,
        )
    }

    /// Creates a relay state with explicit limits.
    #[must_use]
    pub fn with_limits(
        limits: SessionLimits,
        max_connections: usize,
        duplicate_policy: DuplicatePolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: ClientRegistry::new(duplicate_policy),
            limits,
            max_connections,
            connections: AtomicUsize::new(0),
            events,
        }
    }

    /// Returns the client registry.
    #[must_use]
    pub const fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Returns the per-session limits.
    #[must_use]
    pub const fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Returns the number of open connections, including ones still in the
    /// handshake.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Subscribes to relay activity.
    ///
    /// A subscriber that falls more than [`EVENT_CHANNEL_CAPACITY`] events
    /// behind loses the oldest ones; the relay never waits for observers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Closes every registered session.
    ///
    /// Each session flushes what is already queued for it, shuts down its
    /// socket and unregisters. Useful for graceful shutdown and testing.
    pub fn close_all_connections(&self) {
        for handle in self.registry.handles() {
            tracing::info!(peer_id = %handle.identity(), "closing connection");
            handle.close();
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Applies one engine event.
    fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::Joined(handle) => {
                self.emit(RelayEvent::ClientConnected {
                    identity: handle.identity().to_string(),
                    online: self.registry.len(),
                });
                self.announce_membership();
            }
            EngineEvent::Inbound { from, frame } => self.route(&from, frame),
            EngineEvent::Left {
                identity,
                reason,
                replaced: true,
                ..
            } => {
                // The identity is still online through its newer session.
                self.emit(RelayEvent::ClientReplaced {
                    identity,
                    reason: reason.to_string(),
                });
            }
            EngineEvent::Left {
                identity, reason, ..
            } => {
                self.emit(RelayEvent::ClientDisconnected {
                    identity,
                    reason: reason.to_string(),
                    online: self.registry.len(),
                });
                self.announce_membership();
            }
        }
    }

    /// Routes one frame received from `from`.
    fn route(&self, from: &SessionHandle, frame: Frame) {
        let sender = from.identity();
        let Some(payload) = PayloadSummary::of(&frame) else {
            tracing::warn!(
                peer_id = %sender,
                kind = %frame.kind(),
                "ignoring unexpected frame after handshake"
            );
            return;
        };

        match frame {
            Frame::Text { text } => {
                let relayed = Frame::Text {
                    text: format!("{sender}: {text}"),
                };
                self.fan_out(from, payload, relayed);
            }
            private @ (Frame::Private { .. } | Frame::PrivateFile { .. }) => {
                self.deliver_private(from, payload, private.with_sender(sender));
            }
            other => self.fan_out(from, payload, other.with_sender(sender)),
        }
    }

    /// Queues `frame` for every registered session except the sender.
    fn fan_out(&self, from: &SessionHandle, payload: PayloadSummary, frame: Frame) {
        let frame = Arc::new(frame);
        let recipients = self
            .registry
            .others(from.id())
            .iter()
            .filter(|handle| self.deliver(handle, Arc::clone(&frame)))
            .count();

        tracing::debug!(
            peer_id = %from.identity(),
            kind = %frame.kind(),
            recipients,
            "broadcast relayed"
        );
        self.emit(RelayEvent::Broadcast {
            from: from.identity().to_string(),
            payload,
            recipients,
        });
    }

    /// Queues a private frame for its recipient, or tells the sender the
    /// recipient is not connected.
    fn deliver_private(&self, from: &SessionHandle, payload: PayloadSummary, frame: Frame) {
        let Some(to) = frame.recipient().map(str::to_owned) else {
            return;
        };

        if let Some(recipient) = self.registry.lookup(&to) {
            if self.deliver(&recipient, Arc::new(frame)) {
                tracing::debug!(peer_id = %from.identity(), to = %to, "private frame relayed");
                self.emit(RelayEvent::PrivateDelivered {
                    from: from.identity().to_string(),
                    to,
                    payload,
                });
            }
        } else {
            tracing::debug!(peer_id = %from.identity(), to = %to, "recipient not connected");
            let notice = Frame::Text {
                text: format!("User '{to}' not found."),
            };
            self.emit(RelayEvent::RecipientNotFound {
                from: from.identity().to_string(),
                to,
            });
            self.deliver(from, Arc::new(notice));
        }
    }

    /// Sends the current membership snapshot to everyone.
    fn announce_membership(&self) {
        let frame = Arc::new(Frame::membership(self.registry.snapshot()));
        for handle in self.registry.handles() {
            self.deliver(&handle, Arc::clone(&frame));
        }
    }

    /// Queues one frame on one session. Failures are reported, not retried.
    fn deliver(&self, to: &SessionHandle, frame: Arc<Frame>) -> bool {
        match to.send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(peer_id = %to.identity(), error = %e, "delivery failed");
                self.emit(RelayEvent::DeliveryFailed {
                    to: to.identity().to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }
}

/// Counts one open connection for as long as it is held.
struct ConnectionSlot {
    state: Arc<RelayState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<RelayState>) -> Option<Self> {
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < state.max_connections).then_some(open + 1)
            })
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drives one accepted connection from handshake to disconnect.
///
/// The connection lifecycle:
/// 1. Read the identity frame.
/// 2. Register the session, or refuse it with an `Error` frame.
/// 3. Announce it to the dispatch task.
/// 4. Run the session until it ends; it unregisters itself on the way out.
pub async fn handle_connection(
    stream: TcpStream,
    state: Arc<RelayState>,
    engine: mpsc::Sender<EngineEvent>,
) {
    let peer_addr = stream.peer_addr().ok();

    let session = match Session::open(stream, state.limits).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(peer_addr = ?peer_addr, error = %e, "handshake failed");
            state.emit(RelayEvent::ClientRejected {
                identity: None,
                reason: e.to_string(),
            });
            return;
        }
    };
    let identity = session.identity().to_string();
    tracing::info!(peer_id = %identity, peer_addr = ?peer_addr, "peer registering");

    let mut registration = match state.registry.register(session.handle().clone()) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(peer_id = %identity, error = %e, "registration refused");
            state.emit(RelayEvent::ClientRejected {
                identity: Some(identity),
                reason: e.to_string(),
            });
            session.reject(e.to_string()).await;
            return;
        }
    };
    if let Some(evicted) = registration.take_evicted() {
        tracing::info!(peer_id = %identity, "replacing existing connection (duplicate identity)");
        evicted.close();
    }
    tracing::info!(peer_id = %identity, "peer registered");

    if engine
        .send(EngineEvent::Joined(session.handle().clone()))
        .await
        .is_err()
    {
        tracing::error!(peer_id = %identity, "dispatch task gone, dropping connection");
        return;
    }

    let exit = session.run(registration, engine).await;
    if exit.released {
        tracing::info!(peer_id = %identity, reason = %exit.reason, "peer disconnected and unregistered");
    } else {
        tracing::info!(
            peer_id = %identity,
            reason = %exit.reason,
            "replaced connection closed, newer session keeps the identity"
        );
    }
}

/// Consumes engine events in arrival order until every sender is gone.
async fn dispatch_loop(state: Arc<RelayState>, mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        state.dispatch(event);
    }
    tracing::debug!("dispatch task stopped");
}

/// Accepts connections forever, spawning a task for each.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RelayState>,
    engine: mpsc::Sender<EngineEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let Some(slot) = ConnectionSlot::acquire(&state) else {
                    tracing::warn!(
                        peer_addr = %peer_addr,
                        max_connections = state.max_connections,
                        "connection limit reached, dropping connection"
                    );
                    state.emit(RelayEvent::ClientRejected {
                        identity: None,
                        reason: "connection limit reached".to_string(),
                    });
                    continue;
                };
                tracing::debug!(peer_addr = %peer_addr, "accepted connection");

                let state = Arc::clone(&state);
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _slot = slot;
                    handle_connection(stream, state, engine).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>>
{
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to create a state from the resolved
/// [`RelayConfig`]. Subscribe to the state before calling this to observe the
/// [`RelayEvent::Listening`] event.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>>
{
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    state.emit(RelayEvent::Listening { addr: bound_addr });

    let (engine_tx, engine_rx) = mpsc::channel(ENGINE_QUEUE_SIZE);
    tokio::spawn(dispatch_loop(Arc::clone(&state), engine_rx));
    let handle = tokio::spawn(accept_loop(listener, state, engine_tx));

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for the connection lifecycle: handshake, membership
//! announcements, duplicate identities and shutdown.

use std::sync::Arc;
use std::time::Duration;

use parley_proto::codec::DEFAULT_MAX_FRAME_SIZE;
use parley_proto::Frame;
use parley_relay::events::RelayEvent;
use parley_relay::registry::DuplicatePolicy;
use parley_relay::relay::{self, RelayState};
use parley_relay::session::{SessionLimits, read_frame, write_frame};
use tokio::net::TcpStream;

const TIMEOUT: Duration = Duration::from_secs(5);

/// A raw protocol client.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr, name: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to relay");
        let mut client = Self { stream };
        client.send(Frame::Identity { name: name.into() }).await;
        client
    }

    async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.stream, &frame).await.expect("write frame");
    }

    async fn recv(&mut self) -> Frame {
        tokio::time::timeout(TIMEOUT, read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE))
            .await
            .expect("timed out waiting for frame")
            .expect("read frame")
    }

    async fn await_membership(&mut self, members: &[&str]) {
        loop {
            match self.recv().await {
                Frame::Membership { members: got } if got == members => return,
                Frame::Membership { .. } => {}
                other => panic!("expected membership {members:?}, got {other:?}"),
            }
        }
    }

    async fn recv_message(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Frame::Membership { .. } => {}
                other => return other,
            }
        }
    }

    /// Reads until the relay closes the connection, returning what arrived.
    async fn read_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let next =
                tokio::time::timeout(TIMEOUT, read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE))
                    .await
                    .expect("timed out waiting for close");
            match next {
                Ok(frame) => frames.push(frame),
                Err(_) => return frames,
            }
        }
    }
}

async fn start_relay(state: RelayState) -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(state);
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (addr, state)
}

#[tokio::test]
async fn joins_and_leaves_are_announced_to_everyone() {
    let (addr, _state) = start_relay(RelayState::new()).await;

    let mut alice = TestClient::connect(addr, "alice").await;
    alice.await_membership(&["alice"]).await;

    let mut bob = TestClient::connect(addr, "bob").await;
    bob.await_membership(&["alice", "bob"]).await;
    alice.await_membership(&["alice", "bob"]).await;

    let mut carol = TestClient::connect(addr, "carol").await;
    carol.await_membership(&["alice", "bob", "carol"]).await;
    alice.await_membership(&["alice", "bob", "carol"]).await;
    bob.await_membership(&["alice", "bob", "carol"]).await;

    drop(bob);
    alice.await_membership(&["alice", "carol"]).await;
    carol.await_membership(&["alice", "carol"]).await;
}

#[tokio::test]
async fn duplicate_identity_is_rejected_by_default() {
    let (addr, state) = start_relay(RelayState::new()).await;

    let mut first = TestClient::connect(addr, "alice").await;
    first.await_membership(&["alice"]).await;

    let mut second = TestClient::connect(addr, "alice").await;
    let frames = second.read_until_closed().await;
    assert!(
        matches!(frames.as_slice(), [Frame::Error { reason }] if reason.contains("alice")),
        "expected a single error frame, got {frames:?}"
    );

    // The original holder is untouched.
    assert_eq!(state.registry().snapshot(), vec!["alice"]);
    let mut bob = TestClient::connect(addr, "bob").await;
    bob.await_membership(&["alice", "bob"]).await;
    first.await_membership(&["alice", "bob"]).await;
}

#[tokio::test]
async fn duplicate_identity_replaces_under_replace_policy() {
    let state = RelayState::with_limits(SessionLimits::default(), 16, DuplicatePolicy::Replace);
    let (addr, _state) = start_relay(state).await;

    let mut first = TestClient::connect(addr, "alice").await;
    first.await_membership(&["alice"]).await;

    let mut second = TestClient::connect(addr, "alice").await;
    second.await_membership(&["alice"]).await;
    first.read_until_closed().await;

    let mut bob = TestClient::connect(addr, "bob").await;
    bob.await_membership(&["alice", "bob"]).await;
    second.await_membership(&["alice", "bob"]).await;

    bob.send(Frame::Private {
        from: "bob".into(),
        to: "alice".into(),
        text: "which alice?".into(),
    })
    .await;
    assert_eq!(
        second.recv_message().await,
        Frame::Private {
            from: "bob".into(),
            to: "alice".into(),
            text: "which alice?".into(),
        }
    );
}

#[tokio::test]
async fn replaced_session_is_not_reported_as_disconnected() {
    let state = RelayState::with_limits(SessionLimits::default(), 16, DuplicatePolicy::Replace);
    let (addr, state) = start_relay(state).await;
    let mut events = state.subscribe();

    let mut first = TestClient::connect(addr, "alice").await;
    first.await_membership(&["alice"]).await;
    let mut second = TestClient::connect(addr, "alice").await;
    second.await_membership(&["alice"]).await;
    first.read_until_closed().await;

    let replaced = tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await.unwrap() {
                RelayEvent::ClientReplaced { identity, .. } => break identity,
                RelayEvent::ClientDisconnected { identity, .. } => {
                    panic!("{identity} reported as disconnected while still online");
                }
                _ => {}
            }
        }
    })
    .await
    .expect("replaced event");
    assert_eq!(replaced, "alice");
    assert_eq!(state.registry().snapshot(), vec!["alice"]);

    // The next frame the live alice sees is the membership for bob's join,
    // not a repeat announcement caused by the old session leaving.
    let _bob = TestClient::connect(addr, "bob").await;
    assert_eq!(second.recv().await, Frame::membership(["alice", "bob"]));
}

#[tokio::test]
async fn non_identity_first_frame_is_refused() {
    let (addr, state) = start_relay(RelayState::new()).await;
    let mut events = state.subscribe();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, &Frame::Text { text: "hi".into() })
        .await
        .unwrap();
    let mut client = TestClient { stream };
    assert!(client.read_until_closed().await.is_empty());

    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for rejection")
        .unwrap();
    assert!(matches!(event, RelayEvent::ClientRejected { identity: None, .. }));
    assert!(state.registry().is_empty());
}

#[tokio::test]
async fn identity_with_separator_is_refused() {
    let (addr, state) = start_relay(RelayState::new()).await;

    let mut client = TestClient::connect(addr, "a/b").await;
    assert!(client.read_until_closed().await.is_empty());
    assert!(state.registry().is_empty());
}

#[tokio::test]
async fn silent_connection_times_out() {
    let limits = SessionLimits {
        handshake_timeout: Duration::from_millis(100),
        ..SessionLimits::default()
    };
    let (addr, _state) = start_relay(RelayState::with_limits(limits, 16, DuplicatePolicy::Reject)).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = TestClient { stream };
    assert!(client.read_until_closed().await.is_empty());
}

#[tokio::test]
async fn close_all_connections_disconnects_everyone() {
    let (addr, state) = start_relay(RelayState::new()).await;

    let mut alice = TestClient::connect(addr, "alice").await;
    alice.await_membership(&["alice"]).await;
    let mut bob = TestClient::connect(addr, "bob").await;
    bob.await_membership(&["alice", "bob"]).await;

    state.close_all_connections();

    alice.read_until_closed().await;
    bob.read_until_closed().await;

    tokio::time::timeout(TIMEOUT, async {
        while !state.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry did not empty");
}

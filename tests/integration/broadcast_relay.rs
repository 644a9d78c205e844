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

//! Integration tests for broadcast relaying over real TCP connections.
//!
//! Each test starts an in-process relay on `127.0.0.1:0` and drives it with
//! raw clients that speak the length-prefixed frame protocol directly.

use std::time::Duration;

use parley_proto::codec::DEFAULT_MAX_FRAME_SIZE;
use parley_proto::{FilePayload, Frame};
use parley_relay::relay;
use parley_relay::session::{read_frame, write_frame};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// A raw protocol client.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Connects and sends the identity frame.
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

    /// Reads frames until a membership frame listing exactly `members` arrives.
    async fn await_membership(&mut self, members: &[&str]) {
        loop {
            match self.recv().await {
                Frame::Membership { members: got } if got == members => return,
                Frame::Membership { .. } => {}
                other => panic!("expected membership {members:?}, got {other:?}"),
            }
        }
    }

    /// Reads the next non-membership frame.
    async fn recv_message(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Frame::Membership { .. } => {}
                other => return other,
            }
        }
    }

    /// Asserts nothing but membership updates arrive for a short while.
    async fn assert_no_message(&mut self) {
        let quiet = tokio::time::timeout(QUIET, self.recv_message()).await;
        assert!(quiet.is_err(), "unexpected frame: {:?}", quiet.ok());
    }

    /// Asserts the relay closes this connection.
    async fn assert_closed(&mut self) {
        loop {
            let next =
                tokio::time::timeout(TIMEOUT, read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE))
                    .await
                    .expect("timed out waiting for close");
            if next.is_err() {
                return;
            }
        }
    }
}

/// Starts a relay and connects the given clients in order, waiting until all
/// of them have seen the full membership.
async fn start_with_clients(names: &[&str]) -> (std::net::SocketAddr, Vec<TestClient>) {
    let (addr, _handle) = relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");

    let mut clients: Vec<TestClient> = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let mut joined: Vec<&str> = names[..=i].to_vec();
        joined.sort_unstable();
        clients.push(TestClient::connect(addr, name).await);
        for client in &mut clients {
            client.await_membership(&joined).await;
        }
    }
    (addr, clients)
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_sender() {
    let (_addr, mut clients) = start_with_clients(&["alice", "bob", "carol"]).await;

    clients[0]
        .send(Frame::Broadcast {
            from: "mallory".into(),
            text: "hello all".into(),
        })
        .await;

    let expected = Frame::Broadcast {
        from: "alice".into(),
        text: "hello all".into(),
    };
    assert_eq!(clients[1].recv_message().await, expected);
    assert_eq!(clients[2].recv_message().await, expected);
    clients[0].assert_no_message().await;
    clients[1].assert_no_message().await;
}

#[tokio::test]
async fn plain_text_is_relayed_with_sender_prefix() {
    let (_addr, mut clients) = start_with_clients(&["alice", "bob"]).await;

    clients[1].send(Frame::Text { text: "hey".into() }).await;

    assert_eq!(
        clients[0].recv_message().await,
        Frame::Text {
            text: "bob: hey".into()
        }
    );
    clients[1].assert_no_message().await;
}

#[tokio::test]
async fn broadcast_file_arrives_byte_exact() {
    let (_addr, mut clients) = start_with_clients(&["alice", "bob"]).await;

    let data: Vec<u8> = (0..64 * 1024u32)
        .map(|i| u8::try_from(i % 7).unwrap())
        .collect();
    let file = FilePayload::new("pattern.bin", data);
    clients[0]
        .send(Frame::BroadcastFile {
            from: "alice".into(),
            file: file.clone(),
        })
        .await;

    assert_eq!(
        clients[1].recv_message().await,
        Frame::BroadcastFile {
            from: "alice".into(),
            file,
        }
    );
}

#[tokio::test]
async fn frames_from_one_sender_keep_their_order() {
    let (_addr, mut clients) = start_with_clients(&["alice", "bob"]).await;

    for i in 0..50 {
        clients[0]
            .send(Frame::Broadcast {
                from: "alice".into(),
                text: format!("message {i}"),
            })
            .await;
    }
    for i in 0..50 {
        assert_eq!(
            clients[1].recv_message().await,
            Frame::Broadcast {
                from: "alice".into(),
                text: format!("message {i}"),
            }
        );
    }
}

#[tokio::test]
async fn departed_client_no_longer_receives() {
    let (_addr, mut clients) = start_with_clients(&["alice", "bob", "carol"]).await;

    let carol = clients.pop().unwrap();
    drop(carol);
    clients[0].await_membership(&["alice", "bob"]).await;
    clients[1].await_membership(&["alice", "bob"]).await;

    clients[0]
        .send(Frame::Broadcast {
            from: "alice".into(),
            text: "still here?".into(),
        })
        .await;
    assert_eq!(
        clients[1].recv_message().await,
        Frame::Broadcast {
            from: "alice".into(),
            text: "still here?".into(),
        }
    );
}

#[tokio::test]
async fn malformed_frame_closes_only_the_offender() {
    let (addr, mut clients) = start_with_clients(&["alice", "bob"]).await;

    // Length 5, unknown tag 0xff, four bytes of junk.
    clients[1]
        .stream
        .write_all(&[0, 0, 0, 5, 0xff, 1, 2, 3, 4])
        .await
        .unwrap();
    clients[1].assert_closed().await;

    clients[0].await_membership(&["alice"]).await;
    let mut dave = TestClient::connect(addr, "dave").await;
    dave.await_membership(&["alice", "dave"]).await;
    clients[0].await_membership(&["alice", "dave"]).await;

    dave.send(Frame::Broadcast {
        from: "dave".into(),
        text: "hi alice".into(),
    })
    .await;
    assert_eq!(
        clients[0].recv_message().await,
        Frame::Broadcast {
            from: "dave".into(),
            text: "hi alice".into(),
        }
    );
}

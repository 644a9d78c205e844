//! Observable relay activity.
//!
//! The relay publishes a [`RelayEvent`] for every connection and routing
//! decision on a broadcast channel. The binary prints them as log lines;
//! tests subscribe to wait for specific moments without sleeping.

use std::fmt;
use std::net::SocketAddr;

use parley_proto::{FilePayload, Frame};

/// Capacity of the observer channel. Slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What was relayed, without the file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSummary {
    /// A text message.
    Text(String),
    /// A file transfer.
    File {
        /// Name the sender gave the file.
        filename: String,
        /// Size of the file contents in bytes.
        size: usize,
    },
}

impl PayloadSummary {
    /// Summarizes the payload of a relayable frame.
    #[must_use]
    pub fn of(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Text { text } | Frame::Broadcast { text, .. } | Frame::Private { text, .. } => {
                Some(Self::Text(text.clone()))
            }
            Frame::BroadcastFile { file, .. } | Frame::PrivateFile { file, .. } => {
                Some(Self::file(file))
            }
            Frame::Identity { .. } | Frame::Membership { .. } | Frame::Error { .. } => None,
        }
    }

    fn file(file: &FilePayload) -> Self {
        Self::File {
            filename: file.filename.clone(),
            size: file.data.len(),
        }
    }
}

/// Something the relay did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The listener is bound.
    Listening {
        /// Bound address.
        addr: SocketAddr,
    },
    /// A client completed the handshake and was registered.
    ClientConnected {
        /// Registered identity.
        identity: String,
        /// Number of registered clients afterwards.
        online: usize,
    },
    /// A registered client left.
    ClientDisconnected {
        /// Identity that was released.
        identity: String,
        /// Why the session ended.
        reason: String,
        /// Number of registered clients afterwards.
        online: usize,
    },
    /// A session ended after a newer connection took over its identity.
    /// The identity stays online.
    ClientReplaced {
        /// Identity now held by the newer session.
        identity: String,
        /// Why the old session ended.
        reason: String,
    },
    /// A connection was refused before it became active.
    ClientRejected {
        /// Identity the peer claimed, if it got that far.
        identity: Option<String>,
        /// Why it was refused.
        reason: String,
    },
    /// A frame was fanned out to everyone except its sender.
    Broadcast {
        /// Sender identity.
        from: String,
        /// What was sent.
        payload: PayloadSummary,
        /// Number of sessions it was queued for.
        recipients: usize,
    },
    /// A private frame was queued for its recipient.
    PrivateDelivered {
        /// Sender identity.
        from: String,
        /// Recipient identity.
        to: String,
        /// What was sent.
        payload: PayloadSummary,
    },
    /// A private frame named someone who is not connected.
    RecipientNotFound {
        /// Sender identity.
        from: String,
        /// The missing recipient.
        to: String,
    },
    /// Queuing a frame for a session failed.
    DeliveryFailed {
        /// Intended recipient.
        to: String,
        /// Why delivery failed.
        reason: String,
    },
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { addr } => write!(f, "Listening on {addr}"),
            Self::ClientConnected { identity, online } => {
                write!(f, "Client connected: {identity} ({online} online)")
            }
            Self::ClientDisconnected {
                identity,
                reason,
                online,
            } => write!(
                f,
                "Client disconnected: {identity} ({reason}, {online} online)"
            ),
            Self::ClientReplaced { identity, reason } => write!(
                f,
                "Client reconnected: {identity} (previous connection {reason})"
            ),
            Self::ClientRejected {
                identity: Some(identity),
                reason,
            } => write!(f, "Rejected {identity}: {reason}"),
            Self::ClientRejected {
                identity: None,
                reason,
            } => write!(f, "Rejected connection: {reason}"),
            Self::Broadcast { from, payload, .. } => match payload {
                PayloadSummary::Text(text) => write!(f, "{from}: {text}"),
                PayloadSummary::File { filename, .. } => write!(f, "{from} sent file: {filename}"),
            },
            Self::PrivateDelivered { from, to, payload } => match payload {
                PayloadSummary::Text(text) => write!(f, "[Private] {from} -> {to}: {text}"),
                PayloadSummary::File { filename, .. } => {
                    write!(f, "[Private] {from} -> {to} sent file: {filename}")
                }
            },
            Self::RecipientNotFound { from, to } => write!(f, "{from} -> {to}: user not found"),
            Self::DeliveryFailed { to, reason } => write!(f, "Delivery to {to} failed: {reason}"),
        }
    }
}

//! Frame types exchanged between relay clients and the relay server.
//!
//! A [`Frame`] is the unit of wire exchange. Its kind is decided once, when the
//! frame is decoded, and is never re-inspected from string content downstream.

use std::fmt;

/// Tag constant that prefixes the `/`-joined identity list of a membership frame.
pub const MEMBERSHIP_TAG: &str = "USER_LIST";

/// Separator between identities in a membership frame.
pub const MEMBERSHIP_SEPARATOR: char = '/';

/// A named binary blob carried by the file frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    /// File name as chosen by the sender (never interpreted as a path by the relay).
    pub filename: String,
    /// Raw file bytes. May be empty and may contain any byte value.
    pub data: Vec<u8>,
}

impl FilePayload {
    /// Creates a file payload.
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }
}

/// Messages exchanged between relay clients and the relay server.
///
/// Clients send [`Frame::Identity`] exactly once, as the first frame on a new
/// connection. Every other client frame is a relay request. The `from` field of
/// client-sent frames is ignored: the relay overwrites it with the sender's
/// registered identity before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake: the connecting participant's name.
    Identity {
        /// Participant identity.
        name: String,
    },

    /// Plain text.
    ///
    /// From a client this is an untagged message and is relayed to everyone
    /// else prefixed with the sender's identity. From the server it is a
    /// notice (e.g. "user not found") or such a prefixed relay.
    Text {
        /// Message text.
        text: String,
    },

    /// Text for every connected participant except the sender.
    Broadcast {
        /// Sender identity (server-enforced).
        from: String,
        /// Message text.
        text: String,
    },

    /// Text for exactly one participant.
    Private {
        /// Sender identity (server-enforced).
        from: String,
        /// Recipient identity, used by the server for routing.
        to: String,
        /// Message text.
        text: String,
    },

    /// A file for every connected participant except the sender.
    BroadcastFile {
        /// Sender identity (server-enforced).
        from: String,
        /// The file.
        file: FilePayload,
    },

    /// A file for exactly one participant.
    PrivateFile {
        /// Sender identity (server-enforced).
        from: String,
        /// Recipient identity, used by the server for routing.
        to: String,
        /// The file.
        file: FilePayload,
    },

    /// Current set of connected identities, sent after every join or leave.
    Membership {
        /// Connected identities.
        members: Vec<String>,
    },

    /// Server reports an error condition, typically right before closing.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Discriminant of a [`Frame`], used for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// [`Frame::Identity`].
    Identity,
    /// [`Frame::Text`].
    Text,
    /// [`Frame::Broadcast`].
    Broadcast,
    /// [`Frame::Private`].
    Private,
    /// [`Frame::BroadcastFile`].
    BroadcastFile,
    /// [`Frame::PrivateFile`].
    PrivateFile,
    /// [`Frame::Membership`].
    Membership,
    /// [`Frame::Error`].
    Error,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Text => "text",
            Self::Broadcast => "broadcast",
            Self::Private => "private",
            Self::BroadcastFile => "broadcast-file",
            Self::PrivateFile => "private-file",
            Self::Membership => "membership",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl Frame {
    /// Builds a membership frame from any iterator of identities.
    pub fn membership<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Membership {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the kind of this frame.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Identity { .. } => FrameKind::Identity,
            Self::Text { .. } => FrameKind::Text,
            Self::Broadcast { .. } => FrameKind::Broadcast,
            Self::Private { .. } => FrameKind::Private,
            Self::BroadcastFile { .. } => FrameKind::BroadcastFile,
            Self::PrivateFile { .. } => FrameKind::PrivateFile,
            Self::Membership { .. } => FrameKind::Membership,
            Self::Error { .. } => FrameKind::Error,
        }
    }

    /// Returns the recipient of a private frame.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Private { to, .. } | Self::PrivateFile { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Replaces the `from` field with `sender`, for the kinds that carry one.
    ///
    /// Other kinds are returned unchanged.
    #[must_use]
    pub fn with_sender(mut self, sender: &str) -> Self {
        match &mut self {
            Self::Broadcast { from, .. }
            | Self::Private { from, .. }
            | Self::BroadcastFile { from, .. }
            | Self::PrivateFile { from, .. } => {
                sender.clone_into(from);
            }
            _ => {}
        }
        self
    }
}

//! Binary encoding and decoding for the Parley wire protocol.
//!
//! Wire format of one frame:
//!
//! ```text
//! [u32 body length (BE)][u8 tag][field][field]...
//! ```
//!
//! Every string field is `[u32 length (BE)][UTF-8 bytes]` and every binary
//! field is `[u32 length (BE)][raw bytes]`. Length prefixes are the only
//! framing: payload bytes may take any value, including zero.

use crate::frame::{FilePayload, Frame, MEMBERSHIP_SEPARATOR, MEMBERSHIP_TAG};

/// Default cap on a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every frame and field.
pub const LENGTH_PREFIX_LEN: usize = 4;

const TAG_IDENTITY: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TAG_BROADCAST: u8 = 0x03;
const TAG_PRIVATE: u8 = 0x04;
const TAG_BROADCAST_FILE: u8 = 0x05;
const TAG_PRIVATE_FILE: u8 = 0x06;
const TAG_MEMBERSHIP: u8 = 0x07;
const TAG_ERROR: u8 = 0x08;

/// Error type for codec encode/decode operations.
///
/// Every decode failure means the input is a malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A length prefix points past the end of the available data.
    #[error("truncated frame: need {needed} bytes, only {available} available")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },
    /// The frame tag is not one this protocol defines.
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),
    /// The declared frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared body length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A string field does not hold valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// Bytes remain after the last field of the frame body.
    #[error("{0} unexpected bytes after frame body")]
    TrailingBytes(usize),
    /// A membership list is missing its tag or holds an unencodable name.
    #[error("invalid membership list: {0}")]
    InvalidMembership(String),
    /// A field is too long to express with a 4-byte length prefix.
    #[error("field of {0} bytes is too long to encode")]
    FieldTooLong(usize),
}

/// Encodes a [`Frame`] body (tag and fields, no outer length prefix).
///
/// # Errors
///
/// Returns `CodecError::FieldTooLong` if a field exceeds `u32::MAX` bytes, or
/// `CodecError::InvalidMembership` if a member name is empty or contains the
/// membership separator.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match frame {
        Frame::Identity { name } => {
            out.push(TAG_IDENTITY);
            put_str(&mut out, name)?;
        }
        Frame::Text { text } => {
            out.push(TAG_TEXT);
            put_str(&mut out, text)?;
        }
        Frame::Broadcast { from, text } => {
            out.push(TAG_BROADCAST);
            put_str(&mut out, from)?;
            put_str(&mut out, text)?;
        }
        Frame::Private { from, to, text } => {
            out.push(TAG_PRIVATE);
            put_str(&mut out, from)?;
            put_str(&mut out, to)?;
            put_str(&mut out, text)?;
        }
        Frame::BroadcastFile { from, file } => {
            out.push(TAG_BROADCAST_FILE);
            put_str(&mut out, from)?;
            put_file(&mut out, file)?;
        }
        Frame::PrivateFile { from, to, file } => {
            out.push(TAG_PRIVATE_FILE);
            put_str(&mut out, from)?;
            put_str(&mut out, to)?;
            put_file(&mut out, file)?;
        }
        Frame::Membership { members } => {
            out.push(TAG_MEMBERSHIP);
            put_str(&mut out, &join_membership(members)?)?;
        }
        Frame::Error { reason } => {
            out.push(TAG_ERROR);
            put_str(&mut out, reason)?;
        }
    }
    Ok(out)
}

/// Decodes a [`Frame`] from a complete frame body.
///
/// The body must be consumed exactly; leftover bytes are an error.
///
/// # Errors
///
/// Returns a [`CodecError`] describing why the body is malformed.
pub fn decode(body: &[u8]) -> Result<Frame, CodecError> {
    let mut reader = Reader::new(body);
    let frame = match reader.u8()? {
        TAG_IDENTITY => Frame::Identity {
            name: reader.string()?,
        },
        TAG_TEXT => Frame::Text {
            text: reader.string()?,
        },
        TAG_BROADCAST => Frame::Broadcast {
            from: reader.string()?,
            text: reader.string()?,
        },
        TAG_PRIVATE => Frame::Private {
            from: reader.string()?,
            to: reader.string()?,
            text: reader.string()?,
        },
        TAG_BROADCAST_FILE => Frame::BroadcastFile {
            from: reader.string()?,
            file: reader.file()?,
        },
        TAG_PRIVATE_FILE => Frame::PrivateFile {
            from: reader.string()?,
            to: reader.string()?,
            file: reader.file()?,
        },
        TAG_MEMBERSHIP => Frame::Membership {
            members: split_membership(&reader.string()?)?,
        },
        TAG_ERROR => Frame::Error {
            reason: reader.string()?,
        },
        other => return Err(CodecError::UnknownTag(other)),
    };
    match reader.remaining() {
        0 => Ok(frame),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

/// Encodes a [`Frame`] with its 4-byte big-endian length prefix.
///
/// This is the form written to a stream transport.
///
/// # Errors
///
/// Returns the same errors as [`encode`], or `CodecError::FieldTooLong` if the
/// whole body exceeds `u32::MAX` bytes.
pub fn encode_framed(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let body = encode(frame)?;
    let len = prefix_for(body.len())?;
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    framed.extend_from_slice(&len);
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decodes one length-prefixed frame from the front of `bytes`.
///
/// Returns the frame and the number of bytes consumed (prefix included), so a
/// buffer holding several frames can be walked frame by frame. Never waits for
/// more input: if the buffer is short the result is `CodecError::Truncated`.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` if the prefix exceeds `max_frame_size`,
/// `CodecError::Truncated` if the buffer ends early, or any body decode error.
pub fn decode_framed(bytes: &[u8], max_frame_size: usize) -> Result<(Frame, usize), CodecError> {
    let header: [u8; LENGTH_PREFIX_LEN] = bytes
        .get(..LENGTH_PREFIX_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(CodecError::Truncated {
            needed: LENGTH_PREFIX_LEN,
            available: bytes.len(),
        })?;
    let body_len = frame_len(header, max_frame_size)?;

    let total_len = LENGTH_PREFIX_LEN + body_len;
    let body = bytes
        .get(LENGTH_PREFIX_LEN..total_len)
        .ok_or(CodecError::Truncated {
            needed: body_len,
            available: bytes.len() - LENGTH_PREFIX_LEN,
        })?;

    Ok((decode(body)?, total_len))
}

/// Reads a frame header and validates the declared body length.
///
/// Stream readers call this before allocating the body buffer.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` if the length exceeds `max_frame_size`.
pub fn frame_len(header: [u8; LENGTH_PREFIX_LEN], max_frame_size: usize) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }
    Ok(len)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn prefix_for(len: usize) -> Result<[u8; LENGTH_PREFIX_LEN], CodecError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| CodecError::FieldTooLong(len))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    out.extend_from_slice(&prefix_for(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    put_bytes(out, s.as_bytes())
}

fn put_file(out: &mut Vec<u8>, file: &FilePayload) -> Result<(), CodecError> {
    put_str(out, &file.filename)?;
    put_bytes(out, &file.data)
}

fn join_membership(members: &[String]) -> Result<String, CodecError> {
    let mut joined = String::from(MEMBERSHIP_TAG);
    for name in members {
        if name.is_empty() || name.contains(MEMBERSHIP_SEPARATOR) {
            return Err(CodecError::InvalidMembership(format!(
                "cannot encode member name {name:?}"
            )));
        }
        joined.push(MEMBERSHIP_SEPARATOR);
        joined.push_str(name);
    }
    Ok(joined)
}

fn split_membership(list: &str) -> Result<Vec<String>, CodecError> {
    let Some(rest) = list.strip_prefix(MEMBERSHIP_TAG) else {
        return Err(CodecError::InvalidMembership(format!(
            "missing {MEMBERSHIP_TAG} tag"
        )));
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let Some(names) = rest.strip_prefix(MEMBERSHIP_SEPARATOR) else {
        return Err(CodecError::InvalidMembership(format!(
            "missing separator after {MEMBERSHIP_TAG} tag"
        )));
    };
    names
        .split(MEMBERSHIP_SEPARATOR)
        .map(|name| {
            if name.is_empty() {
                Err(CodecError::InvalidMembership("empty member name".into()))
            } else {
                Ok(name.to_string())
            }
        })
        .collect()
}

/// Bounds-checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    const fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.buf.len() {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn len_prefix(&mut self) -> Result<usize, CodecError> {
        let bytes = self.take(LENGTH_PREFIX_LEN)?;
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        header.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(header) as usize)
    }

    fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.len_prefix()?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn file(&mut self) -> Result<FilePayload, CodecError> {
        let filename = self.string()?;
        let data = self.bytes()?.to_vec();
        Ok(FilePayload { filename, data })
    }
}

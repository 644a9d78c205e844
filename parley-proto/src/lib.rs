//! Shared protocol definitions for the Parley wire format.

pub mod codec;
pub mod frame;

pub use codec::CodecError;
pub use frame::{FilePayload, Frame, FrameKind};

//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Any valid `Frame` survives a framed encode → decode round-trip.
//! 2. Cutting an encoded frame short always fails with `Truncated`, never hangs
//!    or panics.
//! 3. Random bytes never cause a panic in `decode` / `decode_framed`.
//! 4. Concatenated frames are decoded one at a time at exact boundaries.

use parley_proto::codec::{self, CodecError, DEFAULT_MAX_FRAME_SIZE};
use parley_proto::frame::{FilePayload, Frame};
use proptest::prelude::*;

// --- Strategies for protocol types ---

/// Strategy for identities: non-empty, no membership separator.
fn arb_identity() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_ .-]{1,32}"
}

/// Strategy for free text, including NUL and multi-byte characters.
fn arb_text() -> impl Strategy<Value = String> {
    any::<String>()
}

/// Strategy for file payloads with arbitrary bytes (embedded zeros included).
fn arb_file() -> impl Strategy<Value = FilePayload> {
    (
        "[^/]{0,64}",
        prop::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(filename, data)| FilePayload { filename, data })
}

/// Strategy for every `Frame` kind.
fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        arb_identity().prop_map(|name| Frame::Identity { name }),
        arb_text().prop_map(|text| Frame::Text { text }),
        (arb_identity(), arb_text()).prop_map(|(from, text)| Frame::Broadcast { from, text }),
        (arb_identity(), arb_identity(), arb_text())
            .prop_map(|(from, to, text)| Frame::Private { from, to, text }),
        (arb_identity(), arb_file()).prop_map(|(from, file)| Frame::BroadcastFile { from, file }),
        (arb_identity(), arb_identity(), arb_file())
            .prop_map(|(from, to, file)| Frame::PrivateFile { from, to, file }),
        prop::collection::vec(arb_identity(), 0..16).prop_map(|members| Frame::Membership { members }),
        arb_text().prop_map(|reason| Frame::Error { reason }),
    ]
}

// --- Property tests ---

proptest! {
    /// Any valid frame survives a framed encode → decode round-trip.
    #[test]
    fn framed_round_trip(frame in arb_frame()) {
        let bytes = codec::encode_framed(&frame).expect("encode_framed should succeed");
        let (decoded, consumed) = codec::decode_framed(&bytes, DEFAULT_MAX_FRAME_SIZE)
            .expect("decode_framed should succeed");
        prop_assert_eq!(&frame, &decoded);
        prop_assert_eq!(consumed, bytes.len());
    }

    /// Every proper prefix of an encoded frame is reported as truncated.
    #[test]
    fn truncated_frame_is_rejected(frame in arb_frame(), cut in any::<prop::sample::Index>()) {
        let bytes = codec::encode_framed(&frame).expect("encode_framed should succeed");
        let short = &bytes[..cut.index(bytes.len())];
        let result = codec::decode_framed(short, DEFAULT_MAX_FRAME_SIZE);
        prop_assert!(
            matches!(result, Err(CodecError::Truncated { .. })),
            "expected Truncated, got {:?}",
            result
        );
    }

    /// Two frames back to back decode at exact boundaries.
    #[test]
    fn concatenated_frames_split_exactly(first in arb_frame(), second in arb_frame()) {
        let mut buffer = codec::encode_framed(&first).expect("encode first");
        let first_len = buffer.len();
        buffer.extend(codec::encode_framed(&second).expect("encode second"));

        let (a, used) = codec::decode_framed(&buffer, DEFAULT_MAX_FRAME_SIZE).expect("decode first");
        prop_assert_eq!(used, first_len);
        let (b, rest) = codec::decode_framed(&buffer[used..], DEFAULT_MAX_FRAME_SIZE)
            .expect("decode second");
        prop_assert_eq!(used + rest, buffer.len());
        prop_assert_eq!(a, first);
        prop_assert_eq!(b, second);
    }

    /// Random bytes never cause a panic when decoded as a frame body.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    /// Random bytes never cause a panic when decoded as a framed message.
    #[test]
    fn random_bytes_decode_framed_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_framed(&bytes, 1024);
    }
}

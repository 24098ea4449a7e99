//! Wire framing for the stream transport.
//!
//! Each frame is `[4-byte big-endian length][payload]`; the payload is a
//! serialized envelope batch. A zero-length payload is the reserved ping
//! frame: it keeps a connection alive and produces no envelope. Real
//! batches always contain at least one envelope and therefore never
//! serialize to zero bytes, so the two cannot collide.

use tokio_util::codec::LengthDelimitedCodec;

/// Builds the length-prefixed codec used on every connection.
pub(crate) fn wire_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Whether a decoded payload is the reserved ping frame.
pub(crate) fn is_ping_frame(payload: &[u8]) -> bool {
    payload.is_empty()
}

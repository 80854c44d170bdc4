//! Framing and protocol error taxonomy (design §7, category (a)).

use thiserror::Error;

/// Errors returned while decoding a frame header or validating a payload.
///
/// These are always recovered locally by the reassembler (drop + resync) and
/// never surface to the game; callers outside this crate should treat them as
/// a signal to call `resynchronize`, not as a fatal condition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame magic did not match the expected constant")]
    InvalidMagic,
    #[error("frame protocol version is not supported")]
    InvalidVersion,
    #[error("buffer does not yet hold a complete header or payload")]
    IncompletePacket,
    #[error("frame length exceeds the maximum accepted frame size")]
    PacketTooLarge,
    #[error("payload length did not match the fixed size for this packet type")]
    InvalidPayloadSize,
}

//! The 12-byte framing header (design 4.1): `magic(4) | version(1) | type(1)
//! | reserved(2) | length(4)`, all little-endian.

use bytes::{Buf, BufMut};

use crate::error::FramingError;
use crate::packet_type::PacketType;

/// Magic constant agreed between every relay client and the relay server.
pub const MAGIC: [u8; 4] = *b"RYLD";

/// Protocol version carried in every header. Bumped only on a breaking wire
/// change; peers with a mismatched version are rejected outright rather than
/// negotiated with, matching the "agreed constants" framing in design §6.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size in bytes of the framing header.
pub const HEADER_LEN: usize = 12;

/// A decoded framing header.
///
/// `packet_type` is `None` when the numeric type id in the frame is not a
/// member of [`PacketType`]; decoding an unknown type is not itself an error
/// (design 4.6: "unknown or undersized packets are silently dropped" is a
/// dispatcher-level policy, not a header-level one), so the header decodes
/// successfully and the dispatcher is responsible for dropping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub packet_type: Option<PacketType>,
    pub raw_type: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Build a header for an outgoing frame. Reserved bytes are always zero.
    pub fn new(packet_type: PacketType, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: Some(packet_type),
            raw_type: packet_type as u8,
            length,
        }
    }

    /// Serialize to the 12-byte wire form.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.raw_type);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.length);
        buf.try_into().expect("header buffer is exactly HEADER_LEN bytes")
    }

    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    ///
    /// Reserved bytes are not checked on read, matching design 4.1's note
    /// that they are "written as zero and not checked on read" (a future
    /// wire revision can repurpose them without breaking older decoders).
    pub fn decode(mut bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::IncompletePacket);
        }
        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(FramingError::InvalidMagic);
        }
        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FramingError::InvalidVersion);
        }
        let raw_type = bytes.get_u8();
        let _reserved = bytes.get_u16_le();
        let length = bytes.get_u32_le();
        if length as usize > crate::MAX_FRAME_SIZE {
            return Err(FramingError::PacketTooLarge);
        }
        Ok(Self {
            version,
            packet_type: PacketType::from_u8(raw_type),
            raw_type,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let header = FrameHeader::new(PacketType::Ping, 8);
        let bytes = header.to_bytes();
        let decoded = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FrameHeader::new(PacketType::Ping, 0).to_bytes();
        bytes[0] ^= 0xFF;
        assert_eq!(FrameHeader::decode(&bytes), Err(FramingError::InvalidMagic));
    }

    #[test]
    fn rejects_incomplete_header() {
        let bytes = FrameHeader::new(PacketType::Ping, 0).to_bytes();
        assert_eq!(
            FrameHeader::decode(&bytes[..HEADER_LEN - 1]),
            Err(FramingError::IncompletePacket)
        );
    }
}

//! Wire format shared between the relay server, the relay client and the P2P
//! joiner/host pair. Everything here is little-endian and fixed-layout so it
//! can be exchanged between independently-versioned peers without a schema
//! negotiation step.
//!
//! The crate is split leaves-first: [`header`] is the 12-byte framing header
//! (component A of the design), [`packet_type`] is the closed set of frame
//! kinds, [`payload`] holds the fixed-layout structures carried by each type,
//! [`node`] holds the virtual-network numbering constants shared by every
//! routing decision, and [`error`] is the framing/protocol error taxonomy.

pub mod error;
pub mod header;
pub mod node;
pub mod packet_type;
pub mod payload;

pub use error::FramingError;
pub use header::{FrameHeader, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
pub use node::{BROADCAST_NODE_ID, MAX_NODES, VirtualIpv4, is_ldn_address};
pub use packet_type::PacketType;

/// Maximum total frame size (header + payload) accepted by the reassembler.
///
/// Chosen generously above the largest fixed payload (`NetworkInfo`, 0x480
/// bytes) plus the largest `ProxyData` payload
/// (`PROXY_SOCKET_MAX_PAYLOAD`, about 1400 bytes) so that legitimate frames
/// are never rejected as oversize.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Encode a complete frame: header followed by payload bytes.
///
/// `payload` must already be the little-endian encoding of the fixed-layout
/// structure for `packet_type`; this function does not know about individual
/// payload shapes, matching the dispatcher's table-driven design in 4.6.
pub fn encode(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(packet_type, payload.len() as u32);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_ping_matches_literal_scenario() {
        let ts: u64 = 0x0102030405060708;
        let payload = ts.to_le_bytes();
        let frame = encode(PacketType::Ping, &payload);
        assert_eq!(frame.len(), HEADER_LEN + 8);
        assert_eq!(&frame[HEADER_LEN..], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        let header = FrameHeader::decode(&frame[..HEADER_LEN]).unwrap();
        assert_eq!(header.packet_type, Some(PacketType::Ping));
        assert_eq!(header.length, 8);
    }
}

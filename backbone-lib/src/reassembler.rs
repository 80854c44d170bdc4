//! Stream reassembler (design 4.2): accumulates raw TCP bytes into a bounded
//! buffer, reports when a complete frame is available, and resynchronizes by
//! discarding bytes one at a time after a framing error.
//!
//! Grounded on `packet_buffer.hpp`'s `PacketBuffer<BufferSize>`: `append`,
//! `has_complete_packet`, `extract_packet` and `discard_until_valid` map
//! directly onto this module's `append`, `has_complete_packet`,
//! `extract_packet` and `resynchronize`. The original shifts the remaining
//! bytes to the front of the buffer on every consume (`consume()`'s memmove);
//! this implementation uses a `VecDeque` so that shift is amortized instead
//! of an explicit `memmove` per call, which is the idiomatic Rust substitute
//! for the same "slide the window" behavior.

use std::collections::VecDeque;

use ryu_protocol::error::FramingError;
use ryu_protocol::header::{FrameHeader, HEADER_LEN};
use ryu_protocol::MAX_FRAME_SIZE;

/// A complete, still-encoded frame pulled out of the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Bounded byte accumulator that turns a TCP byte stream into frames.
pub struct Reassembler {
    buffer: VecDeque<u8>,
    capacity: usize,
}

impl Reassembler {
    /// `capacity` must be at least large enough to hold one maximal frame;
    /// the design requires "≥ max packet size" (4.2).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= HEADER_LEN + MAX_FRAME_SIZE);
        Self { buffer: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(HEADER_LEN + MAX_FRAME_SIZE)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append incoming bytes. Returns `Err` without modifying the buffer if
    /// the bytes would overflow `capacity`.
    pub fn append(&mut self, data: &[u8]) -> Result<(), FramingError> {
        if self.buffer.len() + data.len() > self.capacity {
            return Err(FramingError::PacketTooLarge);
        }
        self.buffer.extend(data);
        Ok(())
    }

    fn peek_contiguous(&self, len: usize) -> Option<Vec<u8>> {
        if self.buffer.len() < len {
            return None
        }
        Some(self.buffer.iter().take(len).copied().collect())
    }

    /// True iff a full header and its declared payload are buffered.
    pub fn has_complete_packet(&self) -> bool {
        self.peek_packet_size().is_some()
    }

    fn peek_packet_size(&self) -> Option<usize> {
        let header_bytes = self.peek_contiguous(HEADER_LEN)?;
        let header = FrameHeader::decode(&header_bytes).ok()?;
        let total = HEADER_LEN + header.length as usize;
        if self.buffer.len() < total {
            return None
        }
        Some(total)
    }

    /// Copy out the next complete frame and remove it from the buffer.
    /// Returns `None` if no complete frame is currently buffered.
    pub fn extract_packet(&mut self) -> Option<RawFrame> {
        let total = self.peek_packet_size()?;
        let header_bytes = self.peek_contiguous(HEADER_LEN).expect("checked above");
        let header = FrameHeader::decode(&header_bytes).expect("checked above");
        let payload: Vec<u8> = self.buffer.iter().skip(HEADER_LEN).take(total - HEADER_LEN).copied().collect();
        self.buffer.drain(..total);
        Some(RawFrame { header, payload })
    }

    /// Discard bytes one at a time until the front of the buffer is a valid
    /// header prefix or the buffer is empty. Returns the number of bytes
    /// discarded. This is the sole recovery path after a framing error
    /// (design 4.2), mirroring `discard_until_valid()`'s loop of
    /// decode-header-or-consume-one-byte.
    pub fn resynchronize(&mut self) -> usize {
        let mut discarded = 0usize;
        loop {
            if self.buffer.is_empty() {
                break;
            }
            match self.peek_contiguous(HEADER_LEN) {
                None => break, // not enough bytes yet to judge; wait for more
                Some(header_bytes) => match FrameHeader::decode(&header_bytes) {
                    Ok(_) => break,
                    Err(FramingError::IncompletePacket) => break,
                    Err(_) => {
                        self.buffer.pop_front();
                        discarded += 1;
                    }
                },
            }
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ryu_protocol::packet_type::PacketType;

    fn ping_frame() -> Vec<u8> {
        ryu_protocol::encode(PacketType::Ping, &0x0102030405060708u64.to_le_bytes())
    }

    #[test]
    fn single_byte_at_a_time_still_extracts_whole_packet() {
        let frame = ping_frame();
        let mut r = Reassembler::with_default_capacity();
        for (i, byte) in frame.iter().enumerate() {
            r.append(&[*byte]).unwrap();
            if i + 1 < frame.len() {
                assert!(!r.has_complete_packet());
            }
        }
        assert!(r.has_complete_packet());
        let extracted = r.extract_packet().unwrap();
        assert_eq!(extracted.payload, &frame[HEADER_LEN..]);
        assert!(r.is_empty());
    }

    #[test]
    fn two_back_to_back_packets_extract_without_extra_calls() {
        let frame = ping_frame();
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);

        let mut r = Reassembler::with_default_capacity();
        r.append(&stream).unwrap();
        let first = r.extract_packet().unwrap();
        let second = r.extract_packet().unwrap();
        assert_eq!(first.payload, second.payload);
        assert!(r.is_empty());
    }

    #[test]
    fn fragmented_header_then_fragmented_payload() {
        let frame = ping_frame();
        let mut r = Reassembler::with_default_capacity();
        r.append(&frame[0..6]).unwrap();
        assert!(!r.has_complete_packet());
        r.append(&frame[6..HEADER_LEN]).unwrap();
        assert!(!r.has_complete_packet());
        r.append(&frame[HEADER_LEN..HEADER_LEN + 4]).unwrap();
        assert!(!r.has_complete_packet());
        r.append(&frame[HEADER_LEN + 4..]).unwrap();
        assert!(r.has_complete_packet());
        let extracted = r.extract_packet().unwrap();
        assert_eq!(extracted.payload.len(), 8);
        assert!(r.is_empty());
    }

    #[test]
    fn resynchronize_discards_garbage_up_to_next_valid_header() {
        let frame = ping_frame();
        let mut garbage = vec![0xEEu8; 5];
        garbage.extend_from_slice(&frame);

        let mut r = Reassembler::with_default_capacity();
        r.append(&garbage).unwrap();
        assert!(!r.has_complete_packet());
        let discarded = r.resynchronize();
        assert_eq!(discarded, 5);
        assert!(r.has_complete_packet());
    }

    #[test]
    fn append_rejects_overflow_without_mutating_buffer() {
        let mut r = Reassembler::new(HEADER_LEN + MAX_FRAME_SIZE);
        let oversized = vec![0u8; r.capacity + 1];
        let before = r.len();
        assert!(r.append(&oversized).is_err());
        assert_eq!(r.len(), before);
    }
}

//! Packet dispatcher (design 4.6), grounded on `ldn_packet_dispatcher.hpp`'s
//! `LdnPacketDispatcher`: a per-type handler table that validates a decoded
//! frame's payload length against [`PacketType::accepts_len`] before handing
//! the raw bytes to whichever handler is registered for that type.
//!
//! The original's `PacketHandler<T>` template plus `RegisterHandler`/
//! `Dispatch` pair is expressed here as a `HashMap<PacketType, Handler>`
//! rather than a vtable, matching the closed-sum-type dispatch style used
//! throughout this crate (design §9). Registration is not thread-safe by
//! design, mirroring the original's explicit "handler registration should be
//! done before starting the receive loop" contract: callers wire up every
//! handler once, before the relay client's owner thread starts ticking.

use std::collections::HashMap;

use ryu_protocol::header::FrameHeader;
use ryu_protocol::packet_type::PacketType;

/// Invoked with the decoded header and the still-encoded payload bytes.
pub type Handler = Box<dyn FnMut(&FrameHeader, &[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// The payload length did not match the type's declared shape; the
    /// frame was dropped without invoking any handler (design 4.6: "unknown
    /// or undersized packets are silently dropped").
    Dropped,
    /// No handler is registered for this (valid) packet type.
    Unhandled,
}

/// Routes decoded frames to per-type handlers. Held by the relay client and
/// fed one frame at a time from the reassembler.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: HashMap<PacketType, Handler>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Registers (or replaces) the handler for `packet_type`. Not meant to be
    /// called once the owning relay client has started its receive loop.
    pub fn register(&mut self, packet_type: PacketType, handler: Handler) {
        self.handlers.insert(packet_type, handler);
    }

    pub fn unregister(&mut self, packet_type: PacketType) {
        self.handlers.remove(&packet_type);
    }

    pub fn is_registered(&self, packet_type: PacketType) -> bool {
        self.handlers.contains_key(&packet_type)
    }

    /// Validates `payload`'s length against `header`'s packet type and, if
    /// it is acceptable, invokes the registered handler.
    pub fn dispatch(&mut self, header: &FrameHeader, payload: &[u8]) -> DispatchOutcome {
        let Some(packet_type) = header.packet_type else {
            return DispatchOutcome::Dropped;
        };
        if !packet_type.accepts_len(payload.len()) {
            return DispatchOutcome::Dropped;
        }
        match self.handlers.get_mut(&packet_type) {
            Some(handler) => {
                handler(header, payload);
                DispatchOutcome::Handled
            }
            None => DispatchOutcome::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn undersized_payload_is_dropped_without_invoking_handler() {
        let mut dispatcher = PacketDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        dispatcher.register(
            PacketType::Ping,
            Box::new(move |_, _| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let header = FrameHeader::new(PacketType::Ping, 3);
        let outcome = dispatcher.dispatch(&header, &[0, 0, 0]);
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_type_is_dropped() {
        let mut dispatcher = PacketDispatcher::new();
        let header = FrameHeader {
            version: ryu_protocol::header::PROTOCOL_VERSION,
            packet_type: None,
            raw_type: 0xFE,
            length: 0,
        };
        assert_eq!(dispatcher.dispatch(&header, &[]), DispatchOutcome::Dropped);
    }

    #[test]
    fn registered_handler_receives_valid_payload() {
        let mut dispatcher = PacketDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        dispatcher.register(
            PacketType::Ping,
            Box::new(move |_, payload| {
                seen_cb.store(payload.len(), Ordering::SeqCst);
            }),
        );
        let header = FrameHeader::new(PacketType::Ping, 8);
        assert_eq!(dispatcher.dispatch(&header, &[0u8; 8]), DispatchOutcome::Handled);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn valid_but_unregistered_type_reports_unhandled() {
        let mut dispatcher = PacketDispatcher::new();
        let header = FrameHeader::new(PacketType::Disconnect, 0);
        assert_eq!(dispatcher.dispatch(&header, &[]), DispatchOutcome::Unhandled);
    }

    #[test]
    fn unregister_stops_further_dispatch() {
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(PacketType::Ping, Box::new(|_, _| {}));
        assert!(dispatcher.is_registered(PacketType::Ping));
        dispatcher.unregister(PacketType::Ping);
        assert!(!dispatcher.is_registered(PacketType::Ping));
        let header = FrameHeader::new(PacketType::Ping, 8);
        assert_eq!(dispatcher.dispatch(&header, &[0u8; 8]), DispatchOutcome::Unhandled);
    }
}

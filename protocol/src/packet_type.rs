//! The closed set of frame kinds (design §6) and the fixed-size table the
//! packet dispatcher (4.6) validates every payload against.

/// Every frame type exchanged between a relay client and the relay server,
/// and between a P2P joiner and a P2P host.
///
/// Represented as a closed sum type rather than a table of function pointers
/// (design §9, "dynamic dispatch on packet type") so an unknown type is a
/// decode-time `None`, not a runtime lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Initialize = 0,
    Connected = 1,
    SyncNetwork = 2,
    ScanReply = 3,
    ScanReplyEnd = 4,
    Disconnect = 5,
    Ping = 6,
    NetworkError = 7,
    ProxyConfig = 8,
    ProxyConnect = 9,
    ProxyConnectReply = 10,
    ProxyData = 11,
    ProxyDisconnect = 12,
    Reject = 13,
    RejectReply = 14,
    SetAcceptPolicy = 15,
    ExternalProxyConfig = 16,
    ExternalProxyToken = 17,
}

/// Shape of a packet type's payload, as validated by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// No payload at all (e.g. `ScanReplyEnd`).
    Empty,
    /// Exactly `n` bytes.
    Fixed(usize),
    /// A fixed header of `header_len` bytes followed by a variable tail
    /// (e.g. `ProxyData`, whose tail is the proxied application payload).
    HeaderPlusTail { header_len: usize },
}

impl PacketType {
    /// All packet types, for iteration in tests and dispatcher setup.
    pub const ALL: [PacketType; 18] = [
        PacketType::Initialize,
        PacketType::Connected,
        PacketType::SyncNetwork,
        PacketType::ScanReply,
        PacketType::ScanReplyEnd,
        PacketType::Disconnect,
        PacketType::Ping,
        PacketType::NetworkError,
        PacketType::ProxyConfig,
        PacketType::ProxyConnect,
        PacketType::ProxyConnectReply,
        PacketType::ProxyData,
        PacketType::ProxyDisconnect,
        PacketType::Reject,
        PacketType::RejectReply,
        PacketType::SetAcceptPolicy,
        PacketType::ExternalProxyConfig,
        PacketType::ExternalProxyToken,
    ];

    /// Recover a packet type from its wire id, or `None` if it is not a
    /// member of the closed set (the header still decodes; the frame is
    /// dropped by the dispatcher, not by the header decoder).
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == value)
    }

    /// The payload shape the dispatcher validates incoming frames against.
    pub fn payload_shape(self) -> PayloadShape {
        use crate::payload::*;
        match self {
            PacketType::Initialize => PayloadShape::Fixed(INITIALIZE_SIZE),
            PacketType::Connected => PayloadShape::Fixed(CONNECTED_SIZE),
            PacketType::SyncNetwork => PayloadShape::Fixed(SYNC_NETWORK_SIZE),
            PacketType::ScanReply => PayloadShape::Fixed(NETWORK_INFO_SIZE),
            PacketType::ScanReplyEnd => PayloadShape::Empty,
            PacketType::Disconnect => PayloadShape::Empty,
            PacketType::Ping => PayloadShape::Fixed(PING_SIZE),
            PacketType::NetworkError => PayloadShape::Fixed(NETWORK_ERROR_SIZE),
            PacketType::ProxyConfig => PayloadShape::Fixed(PROXY_CONFIG_SIZE),
            PacketType::ProxyConnect => PayloadShape::Fixed(PROXY_CONNECT_SIZE),
            PacketType::ProxyConnectReply => PayloadShape::Fixed(PROXY_CONNECT_REPLY_SIZE),
            PacketType::ProxyData => PayloadShape::HeaderPlusTail {
                header_len: PROXY_DATA_HEADER_SIZE,
            },
            PacketType::ProxyDisconnect => PayloadShape::Fixed(PROXY_DISCONNECT_SIZE),
            PacketType::Reject => PayloadShape::Fixed(REJECT_SIZE),
            PacketType::RejectReply => PayloadShape::Empty,
            PacketType::SetAcceptPolicy => PayloadShape::Fixed(SET_ACCEPT_POLICY_SIZE),
            PacketType::ExternalProxyConfig => PayloadShape::Fixed(EXTERNAL_PROXY_CONFIG_SIZE),
            PacketType::ExternalProxyToken => PayloadShape::Fixed(EXTERNAL_PROXY_TOKEN_SIZE),
        }
    }

    /// Whether `len` is an acceptable payload length for this type.
    pub fn accepts_len(self, len: usize) -> bool {
        match self.payload_shape() {
            PayloadShape::Empty => len == 0,
            PayloadShape::Fixed(n) => len == n,
            PayloadShape::HeaderPlusTail { header_len } => len >= header_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_type_through_its_wire_id() {
        for t in PacketType::ALL {
            assert_eq!(PacketType::from_u8(t as u8), Some(t));
        }
    }

    #[test]
    fn unknown_id_decodes_to_none() {
        assert_eq!(PacketType::from_u8(0xFE), None);
    }
}

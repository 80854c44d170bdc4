//! P2P joiner client (design 4.13), grounded on `p2p_proxy_client.hpp`'s
//! `P2pProxyClient`: a direct TCP client that authenticates to a P2P host
//! with a relay-minted token and, once accepted, forwards proxy frames in
//! both directions without going through the relay server.
//!
//! Reuses [`crate::relay_client::RelayTransport`]/[`RelayConnector`] rather
//! than declaring a second transport seam — both clients open one TCP
//! connection and drive it from a `tick(now)` pump, so the abstraction is
//! identical even though the wire conversation differs.

use std::time::{Duration, Instant};

use ryu_protocol::header::FrameHeader;
use ryu_protocol::packet_type::PacketType;
use ryu_protocol::payload::{
    ExternalProxyConfig, ProxyAddressHeader, ProxyConfig, ProxyConnect, ProxyConnectReply, ProxyData,
    ProxyDisconnect, Token,
};

use crate::errors::{ConnectionError, StateError};
use crate::reassembler::Reassembler;
use crate::relay_client::{RelayConnector, RelayTransport, TcpRelayConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pJoinerState {
    Disconnected,
    Connected,
    Authenticating,
    Ready,
}

#[derive(Debug, Clone)]
pub struct P2pJoinerConfig {
    pub connect_timeout: Duration,
    /// Matches the original's `FAILURE_TIMEOUT_MS`: how long to wait for a
    /// `ProxyConfig` reply after sending `ExternalProxyConfig`.
    pub ready_timeout: Duration,
}

impl Default for P2pJoinerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            ready_timeout: Duration::from_millis(4000),
        }
    }
}

/// Invoked for every proxy frame received once the client is `Ready`, with
/// the still-encoded payload (the caller, the BSD interceptor's routing
/// layer, decodes it further).
pub type ProxyPacketHandler = Box<dyn FnMut(PacketType, &[u8]) + Send>;

/// Direct TCP client to a P2P host, owned and ticked by a single thread.
pub struct P2pJoinerClient {
    config: P2pJoinerConfig,
    connector: Box<dyn RelayConnector>,
    transport: Option<Box<dyn RelayTransport>>,
    reassembler: Reassembler,
    state: P2pJoinerState,
    auth_started_at: Option<Instant>,
    proxy_config: Option<ProxyConfig>,
    packet_callback: Option<ProxyPacketHandler>,
    scratch: Vec<u8>,
}

impl P2pJoinerClient {
    pub fn new(config: P2pJoinerConfig) -> Self {
        Self::with_connector(config, Box::new(TcpRelayConnector))
    }

    pub fn with_connector(config: P2pJoinerConfig, connector: Box<dyn RelayConnector>) -> Self {
        Self {
            config,
            connector,
            transport: None,
            reassembler: Reassembler::with_default_capacity(),
            state: P2pJoinerState::Disconnected,
            auth_started_at: None,
            proxy_config: None,
            packet_callback: None,
            scratch: vec![0u8; 4096],
        }
    }

    pub fn state(&self) -> P2pJoinerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != P2pJoinerState::Disconnected
    }

    pub fn is_ready(&self) -> bool {
        self.state == P2pJoinerState::Ready
    }

    pub fn proxy_config(&self) -> Option<ProxyConfig> {
        self.proxy_config
    }

    pub fn virtual_ip(&self) -> Option<u32> {
        self.proxy_config.map(|c| c.assigned_ip)
    }

    pub fn set_packet_callback(&mut self, callback: ProxyPacketHandler) {
        self.packet_callback = Some(callback);
    }

    /// Opens a TCP connection to the host. Does not authenticate; call
    /// [`Self::perform_auth`] once connected.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectionError> {
        let transport = self
            .connector
            .connect(host, port, self.config.connect_timeout)
            .map_err(|_| ConnectionError::ConnectFailed)?;
        self.transport = Some(transport);
        self.reassembler = Reassembler::with_default_capacity();
        self.state = P2pJoinerState::Connected;
        self.proxy_config = None;
        Ok(())
    }

    /// Sends the relay-minted token. The host answers with `ProxyConfig` if
    /// the token is recognized; timeout is enforced by `tick`.
    pub fn perform_auth(&mut self, token: Token, now: Instant) -> Result<(), StateError> {
        if self.state != P2pJoinerState::Connected {
            return Err(StateError::WrongLocalCommState);
        }
        let payload = ExternalProxyConfig { token }.to_bytes();
        self.write_frame(PacketType::ExternalProxyConfig, &payload)?;
        self.state = P2pJoinerState::Authenticating;
        self.auth_started_at = Some(now);
        Ok(())
    }

    /// Drains buffered bytes, dispatches complete frames, and fails
    /// authentication that has been outstanding longer than
    /// `ready_timeout`. Must be called periodically by the owning thread.
    pub fn tick(&mut self, now: Instant) {
        if self.state == P2pJoinerState::Authenticating
            && self.auth_started_at.is_some_and(|start| now.duration_since(start) >= self.config.ready_timeout)
        {
            self.disconnect();
            return;
        }
        self.drain_incoming();
    }

    fn drain_incoming(&mut self) {
        let Some(transport) = self.transport.as_mut() else { return };
        loop {
            let n = match transport.try_recv(&mut self.scratch) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => {
                    self.disconnect();
                    return;
                }
            };
            if self.reassembler.append(&self.scratch[..n]).is_err() {
                self.reassembler.resynchronize();
                continue;
            }
            while let Some(frame) = self.reassembler.extract_packet() {
                self.process_frame(frame.header, frame.payload);
            }
        }
    }

    fn process_frame(&mut self, header: FrameHeader, payload: Vec<u8>) {
        let Some(packet_type) = header.packet_type else { return };
        if !packet_type.accepts_len(payload.len()) {
            return;
        }
        match packet_type {
            PacketType::ProxyConfig if self.state == P2pJoinerState::Authenticating => {
                if let Ok(config) = ProxyConfig::from_bytes(&payload) {
                    self.proxy_config = Some(config);
                    self.state = P2pJoinerState::Ready;
                }
            }
            PacketType::Reject if self.state == P2pJoinerState::Authenticating => {
                self.disconnect();
            }
            PacketType::ProxyData
            | PacketType::ProxyConnect
            | PacketType::ProxyConnectReply
            | PacketType::ProxyDisconnect
                if self.state == P2pJoinerState::Ready =>
            {
                if let Some(callback) = self.packet_callback.as_mut() {
                    callback(packet_type, &payload);
                }
            }
            _ => {}
        }
    }

    fn write_frame(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), StateError> {
        let Some(transport) = self.transport.as_mut() else { return Err(StateError::NotReady) };
        let frame = ryu_protocol::encode(packet_type, payload);
        if transport.send_all(&frame).is_err() {
            return Err(StateError::NotReady);
        }
        Ok(())
    }

    fn send_ready(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), StateError> {
        if self.state != P2pJoinerState::Ready {
            return Err(StateError::NotReady);
        }
        self.write_frame(packet_type, payload)
    }

    pub fn send_proxy_data(&mut self, header: ProxyAddressHeader, payload: &[u8]) -> Result<(), StateError> {
        let frame = ProxyData { header, payload: payload.to_vec() };
        self.send_ready(PacketType::ProxyData, &frame.to_bytes())
    }

    pub fn send_proxy_connect(&mut self, request: ProxyConnect) -> Result<(), StateError> {
        self.send_ready(PacketType::ProxyConnect, &request.to_bytes())
    }

    pub fn send_proxy_connect_reply(&mut self, response: ProxyConnectReply) -> Result<(), StateError> {
        self.send_ready(PacketType::ProxyConnectReply, &response.to_bytes())
    }

    pub fn send_proxy_disconnect(&mut self, node_id: u8) -> Result<(), StateError> {
        self.send_ready(PacketType::ProxyDisconnect, &ProxyDisconnect { node_id }.to_bytes())
    }

    /// Sends an already-encoded frame verbatim, for callers that built the
    /// frame themselves (mirrors the original's raw `Send`).
    pub fn send_raw(&mut self, frame: &[u8]) -> Result<(), StateError> {
        let Some(transport) = self.transport.as_mut() else { return Err(StateError::NotReady) };
        if transport.send_all(frame).is_err() {
            return Err(StateError::NotReady);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown();
        }
        self.transport = None;
        self.reassembler = Reassembler::with_default_capacity();
        self.state = P2pJoinerState::Disconnected;
        self.auth_started_at = None;
        self.proxy_config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTransportState {
        outbound: Vec<u8>,
        inbound: VecDeque<u8>,
    }

    struct FakeTransport {
        shared: Arc<Mutex<FakeTransportState>>,
    }

    impl RelayTransport for FakeTransport {
        fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.shared.lock().unwrap().outbound.extend_from_slice(data);
            Ok(())
        }
        fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut shared = self.shared.lock().unwrap();
            let n = buf.len().min(shared.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = shared.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
        fn shutdown(&mut self) {}
    }

    struct FakeConnector {
        shared: Arc<Mutex<FakeTransportState>>,
    }

    impl RelayConnector for FakeConnector {
        fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> io::Result<Box<dyn RelayTransport>> {
            Ok(Box::new(FakeTransport { shared: self.shared.clone() }))
        }
    }

    fn push_frame(shared: &Arc<Mutex<FakeTransportState>>, packet_type: PacketType, payload: &[u8]) {
        let frame = ryu_protocol::encode(packet_type, payload);
        shared.lock().unwrap().inbound.extend(frame);
    }

    fn new_client() -> (P2pJoinerClient, Arc<Mutex<FakeTransportState>>) {
        let shared = Arc::new(Mutex::new(FakeTransportState::default()));
        let client = P2pJoinerClient::with_connector(
            P2pJoinerConfig::default(),
            Box::new(FakeConnector { shared: shared.clone() }),
        );
        (client, shared)
    }

    #[test]
    fn auth_accepted_reaches_ready_and_captures_virtual_ip() {
        let (mut client, shared) = new_client();
        client.connect("127.0.0.1", 39990).unwrap();
        let t0 = Instant::now();
        client.perform_auth([7u8; 16], t0).unwrap();
        assert_eq!(client.state(), P2pJoinerState::Authenticating);

        push_frame(&shared, PacketType::ProxyConfig, &ProxyConfig { assigned_ip: 0x0A72_0003, node_id: 2 }.to_bytes());
        client.tick(t0);
        assert_eq!(client.state(), P2pJoinerState::Ready);
        assert_eq!(client.virtual_ip(), Some(0x0A72_0003));
    }

    #[test]
    fn auth_timeout_disconnects() {
        let (mut client, _shared) = new_client();
        client.connect("127.0.0.1", 39990).unwrap();
        let t0 = Instant::now();
        client.perform_auth([1u8; 16], t0).unwrap();
        client.tick(t0 + Duration::from_millis(4000));
        assert_eq!(client.state(), P2pJoinerState::Disconnected);
    }

    #[test]
    fn rejected_auth_disconnects_immediately() {
        let (mut client, shared) = new_client();
        client.connect("127.0.0.1", 39990).unwrap();
        let t0 = Instant::now();
        client.perform_auth([2u8; 16], t0).unwrap();
        push_frame(&shared, PacketType::Reject, &[0, 0, 0, 0]);
        client.tick(t0);
        assert_eq!(client.state(), P2pJoinerState::Disconnected);
    }

    #[test]
    fn proxy_sends_are_rejected_before_ready() {
        let (mut client, _shared) = new_client();
        let header = ProxyAddressHeader { src_ip: 1, src_port: 1, dst_ip: 2, dst_port: 2, protocol: 6 };
        assert_eq!(client.send_proxy_data(header, &[]), Err(StateError::NotReady));
    }

    #[test]
    fn ready_proxy_data_is_forwarded_to_callback() {
        let (mut client, shared) = new_client();
        client.connect("127.0.0.1", 39990).unwrap();
        let t0 = Instant::now();
        client.perform_auth([3u8; 16], t0).unwrap();
        push_frame(&shared, PacketType::ProxyConfig, &ProxyConfig { assigned_ip: 1, node_id: 1 }.to_bytes());
        client.tick(t0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        client.set_packet_callback(Box::new(move |packet_type, payload| {
            seen_cb.lock().unwrap().push((packet_type, payload.to_vec()));
        }));

        let data = ProxyData {
            header: ProxyAddressHeader { src_ip: 1, src_port: 10, dst_ip: 2, dst_port: 20, protocol: 17 },
            payload: vec![9, 9, 9],
        };
        push_frame(&shared, PacketType::ProxyData, &data.to_bytes());
        client.tick(t0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, PacketType::ProxyData);
    }
}

//! Relay client (design 4.5), grounded on `network/client.hpp`'s
//! `RyuLdnClient`: assembles the framing codec, the reassembler, the
//! reconnect policy and the connection state machine into a single
//! blocking, single-owner-thread driver with a `tick(now)` pump, matching
//! the original's documented "update() should be called from the same
//! thread that calls other methods" contract.
//!
//! The transport is abstracted behind [`RelayTransport`]/[`RelayConnector`]
//! rather than hard-coding `std::net::TcpStream`, the same testability seam
//! [`crate::bsd_interceptor::RealSocketLayer`] gives the BSD interceptor.

use std::io;
use std::time::{Duration, Instant};

use ryu_protocol::header::FrameHeader;
use ryu_protocol::packet_type::PacketType;
use ryu_protocol::payload::{Connected, Initialize, Ping, ProxyAddressHeader, ProxyData};

use crate::dispatcher::PacketDispatcher;
use crate::errors::StateError;
use crate::reassembler::Reassembler;
use crate::reconnect::{ReconnectConfig, ReconnectManager};
use crate::state_machine::{ConnectionEvent, ConnectionState, ConnectionStateMachine, StateChangeCallback};

/// Abstraction over an established relay connection. Production code backs
/// this with a non-blocking `std::net::TcpStream`; tests substitute an
/// in-memory duplex buffer.
pub trait RelayTransport: Send {
    /// Sends the full contents of `data`, or fails the connection.
    fn send_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Non-blocking read. Returns `Ok(0)` both on a clean EOF and when no
    /// data is currently available, mirroring `RealSocketLayer::recv`'s
    /// non-blocking convention.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn shutdown(&mut self);
}

/// Opens a new transport to `host:port`. Kept separate from
/// [`RelayTransport`] because connecting is the one operation that needs to
/// happen fresh on every retry rather than against an existing object.
pub trait RelayConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Box<dyn RelayTransport>>;
}

/// `RelayConnector` backed by a real, non-blocking TCP socket.
pub struct TcpRelayConnector;

struct TcpTransport {
    stream: std::net::TcpStream,
}

impl RelayTransport for TcpTransport {
    fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.stream.write_all(data)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl RelayConnector for TcpRelayConnector {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Box<dyn RelayTransport>> {
        use std::net::ToSocketAddrs;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))?;
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(TcpTransport { stream }))
    }
}

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub host: String,
    pub port: u16,
    pub client_id: u64,
    pub mac: [u8; 6],
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_outstanding_pings: u32,
    pub reconnect: ReconnectConfig,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 30456,
            client_id: 0,
            mac: [0; 6],
            connect_timeout: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_millis(15000),
            ping_timeout: Duration::from_millis(10000),
            max_outstanding_pings: 3,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Frames the relay client may hand off to the upper layer (local-comm
/// service) rather than consuming itself. `Connected` and keepalive `Ping`
/// frames are intercepted internally and never reach the dispatcher.
pub type PacketHandler = Box<dyn FnMut(&FrameHeader, &[u8]) + Send>;

/// Blocking relay protocol driver, owned and ticked by a single thread.
pub struct RelayClient {
    config: RelayClientConfig,
    connector: Box<dyn RelayConnector>,
    transport: Option<Box<dyn RelayTransport>>,
    reassembler: Reassembler,
    reconnect: ReconnectManager,
    state: ConnectionStateMachine,
    dispatcher: PacketDispatcher,
    backoff_until: Option<Instant>,
    handshake_started_at: Option<Instant>,
    last_ping_sent_at: Option<Instant>,
    outstanding_pings: u32,
    last_rtt_ms: u64,
    scratch: Vec<u8>,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self::with_connector(config, Box::new(TcpRelayConnector))
    }

    pub fn with_connector(config: RelayClientConfig, connector: Box<dyn RelayConnector>) -> Self {
        let reconnect = ReconnectManager::new(config.reconnect);
        Self {
            config,
            connector,
            transport: None,
            reassembler: Reassembler::with_default_capacity(),
            reconnect,
            state: ConnectionStateMachine::new(),
            dispatcher: PacketDispatcher::new(),
            backoff_until: None,
            handshake_started_at: None,
            last_ping_sent_at: None,
            outstanding_pings: 0,
            last_rtt_ms: 0,
            scratch: vec![0u8; 4096],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn retry_count(&self) -> u32 {
        self.state.retry_count()
    }

    pub fn last_rtt_ms(&self) -> u64 {
        self.last_rtt_ms
    }

    pub fn set_state_change_callback(&mut self, callback: StateChangeCallback) {
        self.state.set_state_change_callback(callback);
    }

    /// Registers a handler for frames the relay client does not itself
    /// consume (everything but `Connected` and keepalive `Ping`).
    pub fn register_handler(&mut self, packet_type: PacketType, handler: PacketHandler) {
        self.dispatcher.register(packet_type, handler);
    }

    /// Kicks off (or retries) a connection attempt. Safe to call from
    /// `Disconnected`, `Backoff`, `Retrying` and `Error`; a no-op from any
    /// other state.
    pub fn connect(&mut self) {
        if self.state.is_transitioning() && self.state.state() != ConnectionState::Backoff {
            return;
        }
        match self.state.state() {
            ConnectionState::Disconnected => {
                self.state.process_event(ConnectionEvent::Connect);
            }
            ConnectionState::Backoff | ConnectionState::Error => {
                self.state.process_event(ConnectionEvent::RetryRequested);
            }
            _ => return,
        }
        self.attempt_connect();
    }

    fn attempt_connect(&mut self) {
        match self.connector.connect(&self.config.host, self.config.port, self.config.connect_timeout) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state.process_event(ConnectionEvent::ConnectSuccess);
                self.reconnect.reset();
                self.begin_handshake();
            }
            Err(_) => {
                self.state.process_event(ConnectionEvent::ConnectFailed);
                self.enter_backoff();
            }
        }
    }

    fn begin_handshake(&mut self) {
        self.state.process_event(ConnectionEvent::HandshakeStarted);
        self.handshake_started_at = Some(Instant::now());
        let payload = Initialize { client_id: self.config.client_id, mac: self.config.mac }.to_bytes();
        let _ = self.write_frame(PacketType::Initialize, &payload);
    }

    fn enter_backoff(&mut self) {
        self.reconnect.record_failure();
        self.backoff_until = Some(Instant::now() + Duration::from_millis(self.reconnect.next_delay_ms() as u64));
        self.transport = None;
        self.reassembler = Reassembler::with_default_capacity();
        self.handshake_started_at = None;
        self.last_ping_sent_at = None;
        self.outstanding_pings = 0;
    }

    /// Advances backoff/handshake/keepalive timers, drains any buffered
    /// bytes, and dispatches complete frames. Must be called periodically
    /// by the owning thread.
    pub fn tick(&mut self, now: Instant) {
        match self.state.state() {
            ConnectionState::Backoff => {
                if self.backoff_until.is_some_and(|deadline| now >= deadline) {
                    self.state.process_event(ConnectionEvent::BackoffExpired);
                    self.attempt_connect();
                }
                return;
            }
            ConnectionState::Handshaking => {
                if self
                    .handshake_started_at
                    .is_some_and(|start| now.duration_since(start) >= self.config.handshake_timeout)
                {
                    self.state.process_event(ConnectionEvent::HandshakeFailed);
                    self.enter_backoff();
                    return;
                }
            }
            ConnectionState::Ready => self.tick_keepalive(now),
            ConnectionState::Disconnected | ConnectionState::Error | ConnectionState::Retrying => return,
            _ => {}
        }
        self.drain_incoming();
    }

    fn tick_keepalive(&mut self, now: Instant) {
        let due = self.last_ping_sent_at.is_none_or(|last| now.duration_since(last) >= self.config.ping_interval);
        if due {
            let payload = Ping { timestamp: now_as_millis(now) }.to_bytes();
            if self.write_frame(PacketType::Ping, &payload).is_ok() {
                self.last_ping_sent_at = Some(now);
                self.outstanding_pings += 1;
            }
        }
        let timed_out = self
            .last_ping_sent_at
            .is_some_and(|last| now.duration_since(last) >= self.config.ping_timeout);
        if self.outstanding_pings > self.config.max_outstanding_pings || timed_out {
            self.state.process_event(ConnectionEvent::ConnectionLost);
            self.enter_backoff();
        }
    }

    fn drain_incoming(&mut self) {
        let Some(transport) = self.transport.as_mut() else { return };
        loop {
            let n = match transport.try_recv(&mut self.scratch) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => {
                    self.state.process_event(ConnectionEvent::ConnectionLost);
                    self.enter_backoff();
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
        match header.packet_type {
            Some(PacketType::Connected) if self.state.state() == ConnectionState::Handshaking => {
                match Connected::from_bytes(&payload) {
                    Ok(Connected { accepted: true }) => {
                        self.state.process_event(ConnectionEvent::HandshakeSuccess);
                    }
                    _ => {
                        self.state.process_event(ConnectionEvent::HandshakeFailed);
                        self.enter_backoff();
                    }
                }
            }
            Some(PacketType::NetworkError) if self.state.state() == ConnectionState::Handshaking => {
                self.state.process_event(ConnectionEvent::HandshakeFailed);
                self.enter_backoff();
            }
            Some(PacketType::Ping) if self.state.is_ready() => {
                if let Ok(pong) = Ping::from_bytes(&payload) {
                    self.outstanding_pings = self.outstanding_pings.saturating_sub(1);
                    self.last_rtt_ms = now_as_millis(Instant::now()).saturating_sub(pong.timestamp);
                }
            }
            _ => {
                self.dispatcher.dispatch(&header, &payload);
            }
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
        if !self.state.is_ready() {
            return Err(StateError::NotReady);
        }
        self.write_frame(packet_type, payload)
    }

    pub fn send_scan(&mut self, filter: &[u8]) -> Result<(), StateError> {
        self.send_ready(PacketType::SyncNetwork, filter)
    }

    pub fn send_create_access_point(&mut self, network_info: &[u8]) -> Result<(), StateError> {
        self.send_ready(PacketType::SyncNetwork, network_info)
    }

    pub fn send_connect(&mut self, connect_network_data: &[u8]) -> Result<(), StateError> {
        self.send_ready(PacketType::SyncNetwork, connect_network_data)
    }

    pub fn send_proxy_data(&mut self, header: ProxyAddressHeader, payload: &[u8]) -> Result<(), StateError> {
        let frame = ProxyData { header, payload: payload.to_vec() };
        self.send_ready(PacketType::ProxyData, &frame.to_bytes())
    }

    /// Relay-relayed fallback for a `ProxyConnect` handshake, used by a
    /// station that has no (or not yet ready) direct P2P path to its host.
    pub fn send_proxy_connect(&mut self, request: ryu_protocol::payload::ProxyConnect) -> Result<(), StateError> {
        self.send_ready(PacketType::ProxyConnect, &request.to_bytes())
    }

    /// Manual ping, outside the automatic keepalive cadence.
    pub fn send_ping(&mut self, now: Instant) -> Result<(), StateError> {
        let payload = Ping { timestamp: now_as_millis(now) }.to_bytes();
        self.send_ready(PacketType::Ping, &payload)?;
        self.last_ping_sent_at = Some(now);
        self.outstanding_pings += 1;
        Ok(())
    }

    /// Disconnects and returns to `Disconnected` from any state.
    pub fn disconnect(&mut self) {
        self.state.process_event(ConnectionEvent::Disconnect);
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown();
        }
        self.transport = None;
        self.reassembler = Reassembler::with_default_capacity();
        self.backoff_until = None;
        self.handshake_started_at = None;
        self.last_ping_sent_at = None;
        self.outstanding_pings = 0;
    }
}

fn now_as_millis(instant: Instant) -> u64 {
    // Relative clock: tests and production both care only about deltas
    // between calls, never about wall-clock epoch alignment.
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(|| instant);
    instant.saturating_duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTransportState {
        outbound: Vec<u8>,
        inbound: VecDeque<u8>,
        fail_connect: bool,
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
            if self.shared.lock().unwrap().fail_connect {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(Box::new(FakeTransport { shared: self.shared.clone() }))
        }
    }

    fn push_frame(shared: &Arc<Mutex<FakeTransportState>>, packet_type: PacketType, payload: &[u8]) {
        let frame = ryu_protocol::encode(packet_type, payload);
        shared.lock().unwrap().inbound.extend(frame);
    }

    fn new_client() -> (RelayClient, Arc<Mutex<FakeTransportState>>) {
        let shared = Arc::new(Mutex::new(FakeTransportState::default()));
        let client = RelayClient::with_connector(
            RelayClientConfig::default(),
            Box::new(FakeConnector { shared: shared.clone() }),
        );
        (client, shared)
    }

    #[test]
    fn handshake_reaches_ready_on_connected_accepted() {
        let (mut client, shared) = new_client();
        client.connect();
        assert_eq!(client.state(), ConnectionState::Handshaking);

        push_frame(&shared, PacketType::Connected, &Connected { accepted: true }.to_bytes());
        client.tick(Instant::now());
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(client.is_ready());
    }

    #[test]
    fn rejected_handshake_enters_backoff() {
        let (mut client, shared) = new_client();
        client.connect();
        push_frame(&shared, PacketType::Connected, &Connected { accepted: false }.to_bytes());
        client.tick(Instant::now());
        assert_eq!(client.state(), ConnectionState::Backoff);
    }

    #[test]
    fn sends_are_rejected_before_ready() {
        let (mut client, _shared) = new_client();
        assert_eq!(client.send_scan(&[]), Err(StateError::NotReady));
        client.connect();
        assert_eq!(client.send_scan(&[]), Err(StateError::NotReady));
    }

    #[test]
    fn handshake_timeout_moves_to_backoff_and_records_failure() {
        let (mut client, _shared) = new_client();
        client.connect();
        assert_eq!(client.retry_count(), 0);
        let later = Instant::now() + Duration::from_millis(6000);
        client.tick(later);
        assert_eq!(client.state(), ConnectionState::Backoff);
    }

    #[test]
    fn ping_timeout_while_ready_enters_backoff() {
        let (mut client, shared) = new_client();
        client.connect();
        push_frame(&shared, PacketType::Connected, &Connected { accepted: true }.to_bytes());
        let t0 = Instant::now();
        client.tick(t0);
        assert!(client.is_ready());

        client.tick(t0 + Duration::from_millis(15000));
        assert_eq!(client.outstanding_pings, 1);
        client.tick(t0 + Duration::from_millis(26000));
        assert_eq!(client.state(), ConnectionState::Backoff);
    }

    #[test]
    fn connect_failure_schedules_backoff_and_retry_reconnects() {
        let (mut client, shared) = new_client();
        shared.lock().unwrap().fail_connect = true;
        client.connect();
        assert_eq!(client.state(), ConnectionState::Backoff);
        assert_eq!(client.retry_count(), 0);

        shared.lock().unwrap().fail_connect = false;
        let deadline = Instant::now() + Duration::from_millis(2000);
        client.tick(deadline);
        assert_eq!(client.state(), ConnectionState::Handshaking);
        assert_eq!(client.retry_count(), 1);
    }
}

//! Local-comm service (design 4.15), grounded on the original sysmodule's
//! top-level LDN service: the state machine from design §3
//! (`None`/`Initialized`/`AccessPoint`/`AccessPointCreated`/`Station`/
//! `StationConnected`/`Error`, `Finalize` reachable from anywhere) wired to
//! the relay client, the node mapper, the proxy receive buffer and,
//! depending on role, a P2P host or joiner.
//!
//! This is the one module in the crate that owns every other subsystem at
//! once, the same way the original's `LdnService` composes
//! `RyuLdnClient`/`LdnNodeMapper`/`P2pProxyServer`/`P2pProxyClient` behind a
//! single request surface. Each public method here corresponds to one game
//! RPC (`Initialize`, `OpenAccessPoint`, `CreateNetwork`, `OpenStation`,
//! `Scan`, `Connect`, `Finalize`) and is synchronous from the caller's point
//! of view: it ticks the owned relay/P2P clients in a short blocking loop
//! until the operation resolves or times out, matching the original's
//! blocking IPC command contract.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ryu_protocol::node::{MAX_NODES, VirtualIpv4};
use ryu_protocol::packet_type::PacketType;
use ryu_protocol::payload::{
    ExternalProxyToken, ProxyAddressHeader, ProxyConnect, ProxyConnectReply, ProxyData, ProxyDisconnect,
    SyncNetworkPayload, CONNECT_NETWORK_DATA_SIZE, NETWORK_INFO_SIZE, SCAN_FILTER_SIZE,
};

use crate::config::ClientIdentity;
use crate::errors::StateError;
use crate::node_mapper::NodeMapper;
use crate::p2p_host::P2pHostServer;
use crate::p2p_joiner::{P2pJoinerClient, P2pJoinerConfig};
use crate::port_mapper::PortMapper;
use crate::port_pool::Protocol;
use crate::proxy_buffer::ProxyReceiveBuffer;
use crate::relay_client::{RelayClient, RelayClientConfig};
use crate::shared_state::{LocalCommState, SessionInfo, SharedState};
use crate::socket_registry::SocketRegistry;
use crate::virtual_socket::VirtualAddr;

/// How long the session may go without any game-driven call before
/// [`LocalCommService::tick`] auto-finalizes it (design §4.15).
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(6);

/// Timeout for the relay's `NetworkInfoUpdate` reply to `CreateNetwork`/
/// `ConnectNetwork`, separate from the relay client's own handshake timeout.
const NETWORK_REPLY_TIMEOUT: Duration = Duration::from_millis(4000);
const SCAN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Which side of a session this service is currently playing, governing how
/// the outbound proxy-data callback routes frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    None,
    Host,
    Station,
}

struct Pending {
    network_reply: Option<SyncNetworkPayload>,
    scan_results: Vec<SyncNetworkPayload>,
    scan_done: bool,
}

/// Owns the relay client, node mapper, proxy buffer and (depending on role)
/// the P2P host or joiner for one local-comm session.
pub struct LocalCommService {
    shared: Arc<SharedState>,
    registry: Arc<SocketRegistry>,
    node_mapper: Arc<NodeMapper>,
    relay: Arc<Mutex<RelayClient>>,
    proxy_buffer: Arc<Mutex<ProxyReceiveBuffer>>,
    port_mapper: Arc<dyn PortMapper>,
    p2p_host: Arc<Mutex<Option<Arc<P2pHostServer>>>>,
    p2p_joiner: Arc<Mutex<Option<P2pJoinerClient>>>,
    role: Mutex<Role>,
    state: Mutex<LocalCommState>,
    last_activity: Mutex<Instant>,
    pending: Arc<Mutex<Pending>>,
}

impl LocalCommService {
    pub fn new(
        shared: Arc<SharedState>,
        registry: Arc<SocketRegistry>,
        identity: ClientIdentity,
        relay_config: RelayClientConfig,
        port_mapper: Arc<dyn PortMapper>,
    ) -> Arc<Self> {
        let mut config = relay_config;
        config.client_id = identity.client_id;
        config.mac = identity.mac;

        let node_mapper = Arc::new(NodeMapper::new());
        let pending = Arc::new(Mutex::new(Pending {
            network_reply: None,
            scan_results: Vec::new(),
            scan_done: false,
        }));

        let p2p_host: Arc<Mutex<Option<Arc<P2pHostServer>>>> = Arc::new(Mutex::new(None));

        let mut relay = RelayClient::new(config);
        wire_relay_handlers(&mut relay, node_mapper.clone(), registry.clone(), pending.clone(), p2p_host.clone());

        let service = Arc::new(Self {
            shared,
            registry,
            node_mapper,
            relay: Arc::new(Mutex::new(relay)),
            proxy_buffer: Arc::new(Mutex::new(ProxyReceiveBuffer::new())),
            port_mapper,
            p2p_host,
            p2p_joiner: Arc::new(Mutex::new(None)),
            role: Mutex::new(Role::None),
            state: Mutex::new(LocalCommState::None),
            last_activity: Mutex::new(Instant::now()),
            pending,
        });
        service.wire_registry_callbacks();
        service
    }

    pub fn state(&self) -> LocalCommState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: LocalCommState) {
        *self.state.lock().unwrap() = state;
        self.shared.set_local_comm_state(state);
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn require_state(&self, expected: LocalCommState) -> Result<(), StateError> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(StateError::WrongLocalCommState)
        }
    }

    fn enter_error(&self) {
        self.set_state(LocalCommState::Error);
    }

    /// Wires the outbound send callbacks the BSD interceptor's virtual
    /// sockets use, routing through the P2P joiner when ready, the P2P host
    /// when hosting, and falling back to the relay link otherwise (design
    /// 4.15's "proxy-data tie-in").
    fn wire_registry_callbacks(self: &Arc<Self>) {
        let send_data_service = self.clone();
        self.registry.set_send_data_callback(Box::new(move |from, to, protocol, data| {
            send_data_service.send_proxy_data(from, to, protocol, data)
        }));

        let send_connect_service = self.clone();
        self.registry.set_send_connect_callback(Box::new(move |from, to| {
            send_connect_service.send_proxy_connect(from, to)
        }));
    }

    fn send_proxy_data(&self, from: VirtualAddr, to: VirtualAddr, protocol: Protocol, data: &[u8]) -> bool {
        let header = ProxyAddressHeader {
            src_ip: from.ip.0,
            src_port: from.port,
            dst_ip: to.ip.0,
            dst_port: to.port,
            protocol: protocol_to_wire(protocol),
        };
        match *self.role.lock().unwrap() {
            Role::Host => {
                let dest = node_id_for_ip(to.ip.0);
                if let Some(host) = self.p2p_host.lock().unwrap().as_ref() {
                    let frame = ProxyData { header, payload: data.to_vec() };
                    host.send_from_host(dest, PacketType::ProxyData, &frame.to_bytes());
                    true
                } else {
                    false
                }
            }
            Role::Station => {
                let mut joiner = self.p2p_joiner.lock().unwrap();
                if let Some(joiner) = joiner.as_mut().filter(|j| j.is_ready()) {
                    return joiner.send_proxy_data(header, data).is_ok();
                }
                drop(joiner);
                self.relay.lock().unwrap().send_proxy_data(header, data).is_ok()
            }
            Role::None => false,
        }
    }

    fn send_proxy_connect(&self, from: VirtualAddr, to: VirtualAddr) -> bool {
        let header = ProxyAddressHeader {
            src_ip: from.ip.0,
            src_port: from.port,
            dst_ip: to.ip.0,
            dst_port: to.port,
            protocol: protocol_to_wire(Protocol::Tcp),
        };
        let request = ProxyConnect { header };
        match *self.role.lock().unwrap() {
            Role::Host => {
                let dest = node_id_for_ip(to.ip.0);
                if let Some(host) = self.p2p_host.lock().unwrap().as_ref() {
                    host.send_from_host(dest, PacketType::ProxyConnect, &request.to_bytes());
                    true
                } else {
                    false
                }
            }
            Role::Station => {
                let mut joiner = self.p2p_joiner.lock().unwrap();
                if let Some(joiner) = joiner.as_mut().filter(|j| j.is_ready()) {
                    return joiner.send_proxy_connect(request).is_ok();
                }
                drop(joiner);
                self.relay.lock().unwrap().send_proxy_connect(request).is_ok()
            }
            Role::None => false,
        }
    }

    /// Acquires the shared-state slot, connects the relay client and loads
    /// the persistent client identity (already baked into the owned relay
    /// client's config at construction), then blocks until the handshake
    /// completes or the connect/handshake timeout elapses.
    pub fn initialize(&self) -> Result<(), StateError> {
        self.require_state(LocalCommState::None)?;
        self.touch_activity();
        self.shared.set_ldn_pid(Some(std::process::id()));
        self.shared.set_game_active(std::process::id());

        self.relay.lock().unwrap().connect();
        let ready = self.wait_until(Duration::from_millis(10_000), |svc| svc.relay.lock().unwrap().is_ready());
        if !ready {
            self.enter_error();
            return Err(StateError::NotReady);
        }
        self.set_state(LocalCommState::Initialized);
        Ok(())
    }

    pub fn open_access_point(&self) -> Result<(), StateError> {
        self.require_state(LocalCommState::Initialized)?;
        self.touch_activity();
        self.node_mapper.set_local_node_id(0);
        self.node_mapper.add_node(0, VirtualIpv4::for_node(0));
        self.registry.set_local_ip(VirtualIpv4::for_node(0));
        *self.role.lock().unwrap() = Role::Host;
        self.set_state(LocalCommState::AccessPoint);
        Ok(())
    }

    pub fn create_network(&self, info: &[u8; NETWORK_INFO_SIZE]) -> Result<(), StateError> {
        self.require_state(LocalCommState::AccessPoint)?;
        self.touch_activity();

        let payload = SyncNetworkPayload::create_network(info);
        self.relay.lock().unwrap().send_create_access_point(&payload.to_bytes())?;

        let reply = self.wait_for_network_reply(NETWORK_REPLY_TIMEOUT);
        let Some(reply) = reply else {
            self.enter_error();
            return Err(StateError::NotReady);
        };

        let host = Arc::new(P2pHostServer::new(self.node_mapper.clone(), self.port_mapper.clone()));
        if host.start(0).is_ok() {
            host.nat_punch();
        }
        *self.p2p_host.lock().unwrap() = Some(host);

        self.shared.set_session_info(Some(SessionInfo {
            node_count: reply.node_count().max(1),
            max_node_count: MAX_NODES,
            local_node_id: 0,
            is_host: true,
        }));
        self.set_state(LocalCommState::AccessPointCreated);
        Ok(())
    }

    pub fn open_station(&self) -> Result<(), StateError> {
        self.require_state(LocalCommState::Initialized)?;
        self.touch_activity();
        *self.role.lock().unwrap() = Role::Station;
        self.set_state(LocalCommState::Station);
        Ok(())
    }

    /// Requests a network listing and blocks until `ScanReplyEnd` arrives or
    /// the scan window elapses, returning whatever `ScanReply` frames were
    /// collected in the meantime.
    pub fn scan(&self, filter: &[u8; SCAN_FILTER_SIZE]) -> Result<Vec<SyncNetworkPayload>, StateError> {
        self.require_state(LocalCommState::Station)?;
        self.touch_activity();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.scan_results.clear();
            pending.scan_done = false;
        }
        let payload = SyncNetworkPayload::scan(filter);
        self.relay.lock().unwrap().send_scan(&payload.to_bytes())?;

        self.wait_until(SCAN_TIMEOUT, |svc| svc.pending.lock().unwrap().scan_done);
        Ok(self.pending.lock().unwrap().scan_results.clone())
    }

    pub fn connect(&self, data: &[u8; CONNECT_NETWORK_DATA_SIZE]) -> Result<(), StateError> {
        self.require_state(LocalCommState::Station)?;
        self.touch_activity();

        let payload = SyncNetworkPayload::connect_network(data);
        self.relay.lock().unwrap().send_connect(&payload.to_bytes())?;

        let reply = self.wait_for_network_reply(NETWORK_REPLY_TIMEOUT);
        let Some(reply) = reply else {
            self.enter_error();
            return Err(StateError::NotReady);
        };

        let local_node_id = reply.assigned_node_id();
        let local_ip = VirtualIpv4(reply.assigned_ip());
        self.node_mapper.set_local_node_id(local_node_id);
        self.node_mapper.add_node(local_node_id, local_ip);
        self.registry.set_local_ip(local_ip);

        if let Some((host_ip, host_port, token)) = reply.p2p_offer() {
            let mut joiner = P2pJoinerClient::new(P2pJoinerConfig::default());
            let addr = std::net::Ipv4Addr::from(host_ip.to_be_bytes());
            if joiner.connect(&addr.to_string(), host_port).is_ok() {
                let now = Instant::now();
                let _ = joiner.perform_auth(token, now);
                *self.p2p_joiner.lock().unwrap() = Some(joiner);
                self.wait_until(Duration::from_millis(4000), |svc| {
                    svc.p2p_joiner.lock().unwrap().as_ref().is_some_and(|j| j.is_ready())
                });
                // A joiner that never reaches Ready silently falls back to
                // routing through the relay link; this is not fatal.
            }
        }

        self.shared.set_session_info(Some(SessionInfo {
            node_count: reply.node_count().max(1),
            max_node_count: MAX_NODES,
            local_node_id,
            is_host: false,
        }));
        self.set_state(LocalCommState::StationConnected);
        Ok(())
    }

    /// Tears the session down from any state and returns to `None` (design
    /// §3: `Finalize` is valid from every state, including `Error`).
    pub fn finalize(&self) {
        if let Some(host) = self.p2p_host.lock().unwrap().take() {
            host.stop();
        }
        if let Some(mut joiner) = self.p2p_joiner.lock().unwrap().take() {
            joiner.disconnect();
        }
        self.relay.lock().unwrap().disconnect();
        self.node_mapper.clear();
        self.proxy_buffer.lock().unwrap().reset();
        *self.role.lock().unwrap() = Role::None;
        self.shared.set_ldn_pid(None);
        self.shared.clear_game_active();
        self.shared.set_session_info(None);
        self.set_state(LocalCommState::None);
    }

    /// Advances the owned relay/P2P clients and auto-finalizes the session
    /// if no game-driven call has touched activity within
    /// [`INACTIVITY_TIMEOUT`]. Must be called periodically by the module
    /// entrypoint's background thread.
    pub fn tick(&self, now: Instant) {
        self.relay.lock().unwrap().tick(now);
        if let Some(joiner) = self.p2p_joiner.lock().unwrap().as_mut() {
            joiner.tick(now);
        }
        self.shared.set_last_rtt_ms(self.relay.lock().unwrap().last_rtt_ms());

        if self.shared.take_reconnect_request() {
            self.relay.lock().unwrap().connect();
        }

        if self.state() != LocalCommState::None {
            let idle = now.saturating_duration_since(*self.last_activity.lock().unwrap());
            if idle >= INACTIVITY_TIMEOUT {
                self.finalize();
            }
        }
    }

    /// Ticks the relay/P2P clients in a short busy-poll loop until
    /// `predicate` is satisfied or `timeout` elapses. Used by the blocking
    /// effect methods above to present a synchronous RPC contract over the
    /// tick-driven relay client.
    fn wait_until(&self, timeout: Duration, predicate: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.relay.lock().unwrap().tick(Instant::now());
            if let Some(joiner) = self.p2p_joiner.lock().unwrap().as_mut() {
                joiner.tick(Instant::now());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_for_network_reply(&self, timeout: Duration) -> Option<SyncNetworkPayload> {
        self.pending.lock().unwrap().network_reply = None;
        self.wait_until(timeout, |svc| svc.pending.lock().unwrap().network_reply.is_some());
        self.pending.lock().unwrap().network_reply.take()
    }
}

fn protocol_to_wire(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Tcp => 6,
        Protocol::Udp => 17,
    }
}

/// The node id a virtual IPv4 belongs to, inverting [`VirtualIpv4::for_node`].
fn node_id_for_ip(ip: u32) -> u32 {
    if ip == VirtualIpv4::broadcast().0 {
        return ryu_protocol::node::BROADCAST_NODE_ID;
    }
    (ip & 0xFF).saturating_sub(1)
}

fn wire_relay_handlers(
    relay: &mut RelayClient,
    node_mapper: Arc<NodeMapper>,
    registry: Arc<SocketRegistry>,
    pending: Arc<Mutex<Pending>>,
    p2p_host: Arc<Mutex<Option<Arc<P2pHostServer>>>>,
) {
    let pending_sync = pending.clone();
    relay.register_handler(
        PacketType::SyncNetwork,
        Box::new(move |_header, payload| {
            if let Ok(decoded) = SyncNetworkPayload::from_bytes(payload) {
                pending_sync.lock().unwrap().network_reply = Some(decoded);
            }
        }),
    );

    let pending_scan = pending.clone();
    relay.register_handler(
        PacketType::ScanReply,
        Box::new(move |_header, payload| {
            let mut info = [0u8; NETWORK_INFO_SIZE];
            if payload.len() == NETWORK_INFO_SIZE {
                info.copy_from_slice(payload);
                pending_scan
                    .lock()
                    .unwrap()
                    .scan_results
                    .push(SyncNetworkPayload::network_info_update(&info));
            }
        }),
    );

    let pending_scan_end = pending.clone();
    relay.register_handler(
        PacketType::ScanReplyEnd,
        Box::new(move |_header, _payload| {
            pending_scan_end.lock().unwrap().scan_done = true;
        }),
    );

    let registry_data = registry.clone();
    relay.register_handler(
        PacketType::ProxyData,
        Box::new(move |_header, payload| {
            if let Ok(data) = ProxyData::from_bytes(payload) {
                let from = VirtualAddr { ip: VirtualIpv4(data.header.src_ip), port: data.header.src_port };
                let to = VirtualAddr { ip: VirtualIpv4(data.header.dst_ip), port: data.header.dst_port };
                registry_data.route_incoming_data(to, from, wire_to_protocol(data.header.protocol), &data.payload);
            }
        }),
    );

    let registry_connect = registry.clone();
    relay.register_handler(
        PacketType::ProxyConnect,
        Box::new(move |_header, payload| {
            if let Ok(request) = ProxyConnect::from_bytes(payload) {
                let from = VirtualAddr { ip: VirtualIpv4(request.header.src_ip), port: request.header.src_port };
                let to = VirtualAddr { ip: VirtualIpv4(request.header.dst_ip), port: request.header.dst_port };
                registry_connect.route_connect_request(to, from);
            }
        }),
    );

    let registry_connect_reply = registry.clone();
    relay.register_handler(
        PacketType::ProxyConnectReply,
        Box::new(move |_header, payload| {
            if let Ok(reply) = ProxyConnectReply::from_bytes(payload) {
                let from = VirtualAddr { ip: VirtualIpv4(reply.header.src_ip), port: reply.header.src_port };
                let to = VirtualAddr { ip: VirtualIpv4(reply.header.dst_ip), port: reply.header.dst_port };
                registry_connect_reply.route_connect_response(to, from, reply.accepted);
            }
        }),
    );

    relay.register_handler(
        PacketType::ProxyDisconnect,
        Box::new(move |_header, payload| {
            if let Ok(disconnect) = ProxyDisconnect::from_bytes(payload) {
                node_mapper.remove_node(disconnect.node_id);
            }
        }),
    );

    relay.register_handler(
        PacketType::ExternalProxyToken,
        Box::new(move |_header, payload| {
            if let Ok(token) = ExternalProxyToken::from_bytes(payload) {
                if let Some(host) = p2p_host.lock().unwrap().as_ref() {
                    host.add_waiting_token(token);
                }
            }
        }),
    );
}

fn wire_to_protocol(protocol: u8) -> Protocol {
    if protocol == 17 { Protocol::Udp } else { Protocol::Tcp }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_mapper::NullPortMapper;

    fn service() -> Arc<LocalCommService> {
        let shared = Arc::new(SharedState::new());
        let registry = Arc::new(SocketRegistry::new());
        let identity = ClientIdentity { client_id: 1, mac: [1, 2, 3, 4, 5, 6] };
        LocalCommService::new(shared, registry, identity, RelayClientConfig::default(), Arc::new(NullPortMapper))
    }

    #[test]
    fn starts_in_none_state() {
        assert_eq!(service().state(), LocalCommState::None);
    }

    #[test]
    fn open_access_point_requires_initialized_state() {
        let svc = service();
        assert_eq!(svc.open_access_point(), Err(StateError::WrongLocalCommState));
    }

    #[test]
    fn finalize_returns_to_none_from_any_state() {
        let svc = service();
        svc.set_state(LocalCommState::Error);
        svc.finalize();
        assert_eq!(svc.state(), LocalCommState::None);
        assert!(svc.shared.ldn_pid().is_none());
    }

    #[test]
    fn node_id_for_ip_inverts_for_node() {
        assert_eq!(node_id_for_ip(VirtualIpv4::for_node(3).0), 3);
        assert_eq!(node_id_for_ip(VirtualIpv4::broadcast().0), ryu_protocol::node::BROADCAST_NODE_ID);
    }

    #[test]
    fn open_station_moves_role_and_state() {
        let svc = service();
        svc.set_state(LocalCommState::Initialized);
        svc.open_station().unwrap();
        assert_eq!(svc.state(), LocalCommState::Station);
        assert_eq!(*svc.role.lock().unwrap(), Role::Station);
    }

    #[test]
    fn scan_outside_station_state_is_rejected() {
        let svc = service();
        assert_eq!(svc.scan(&[0u8; SCAN_FILTER_SIZE]), Err(StateError::WrongLocalCommState));
    }
}

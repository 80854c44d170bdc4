//! P2P host server (design 4.14), grounded on `p2p_proxy_server.hpp`'s
//! `P2pProxyServer`/`P2pProxySession`: a TCP listener that accepts direct
//! joiner connections, authenticates them against a token table the relay
//! populates, and fans proxy frames out using the node mapper the
//! local-comm service already maintains.
//!
//! Unlike the relay client this subsystem is genuinely multi-threaded
//! (design §5): one accept thread, one receive thread per session, and one
//! lease-renewal thread, matching the original's thread-per-connection
//! sysmodule model rather than the relay client's single-thread `tick`
//! pump.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ryu_protocol::header::{FrameHeader, HEADER_LEN};
use ryu_protocol::node::{MAX_NODES, VirtualIpv4};
use ryu_protocol::packet_type::PacketType;
use ryu_protocol::payload::{
    ExternalProxyConfig, ExternalProxyToken, ProxyConfig, ProxyConnect, ProxyConnectReply, ProxyData,
    ProxyDisconnect, Reject,
};

use crate::errors::ConnectionError;
use crate::node_mapper::NodeMapper;
use crate::port_mapper::{PortMapper, P2P_PORT_BASE, P2P_PORT_RANGE, PORT_LEASE_RENEW_SECS};

/// How long an unauthenticated session may stay connected before the host
/// drops it (the original's `AUTH_WAIT_SECONDS`).
pub const AUTH_WAIT: Duration = Duration::from_secs(1);
pub const MAX_PLAYERS: usize = MAX_NODES as usize;

/// Invoked to notify the relay of a session lifecycle event (forwarded by
/// the local-comm service to the relay client's send surface).
pub type MasterSendHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked with proxy frames addressed to the local node (node 0, the host
/// machine's own game process), for delivery into the local virtual socket
/// registry instead of out to a remote session.
pub type LocalDeliverHandler = Box<dyn Fn(PacketType, &[u8]) + Send + Sync>;

/// The node id a virtual IPv4 belongs to, inverting [`VirtualIpv4::for_node`]
/// (`10.114.0.(id+1)`), or the broadcast sentinel if `ip` is the subnet
/// broadcast address.
fn node_id_for_ip(ip: u32) -> u32 {
    if ip == VirtualIpv4::broadcast().0 {
        return ryu_protocol::node::BROADCAST_NODE_ID;
    }
    let octet = ip & 0xFF;
    octet.saturating_sub(1)
}

struct Session {
    stream: Mutex<TcpStream>,
    node_id: Mutex<Option<u8>>,
    virtual_ip: Mutex<Option<u32>>,
    authenticated: AtomicBool,
}

impl Session {
    fn send_frame(&self, packet_type: PacketType, payload: &[u8]) -> bool {
        let frame = ryu_protocol::encode(packet_type, payload);
        self.stream.lock().unwrap().write_all(&frame).is_ok()
    }

    fn node_id(&self) -> Option<u8> {
        *self.node_id.lock().unwrap()
    }
}

struct HostShared {
    node_mapper: Arc<NodeMapper>,
    sessions: Mutex<Vec<Arc<Session>>>,
    waiting_tokens: Mutex<Vec<ExternalProxyToken>>,
    free_node_ids: Mutex<Vec<u8>>,
    master_send: Mutex<Option<MasterSendHandler>>,
    local_deliver: Mutex<Option<LocalDeliverHandler>>,
}

impl HostShared {
    fn new(node_mapper: Arc<NodeMapper>) -> Self {
        Self {
            node_mapper,
            sessions: Mutex::new(Vec::new()),
            waiting_tokens: Mutex::new(Vec::new()),
            free_node_ids: Mutex::new((1..MAX_NODES).collect()),
            master_send: Mutex::new(None),
            local_deliver: Mutex::new(None),
        }
    }

    fn add_waiting_token(&self, token: ExternalProxyToken) {
        self.waiting_tokens.lock().unwrap().push(token);
    }

    /// Validates `config`'s token against the waiting table and, on match,
    /// assigns the token's reserved node id and virtual IPv4.
    fn try_register(&self, config: ExternalProxyConfig) -> Option<(u8, u32)> {
        let mut tokens = self.waiting_tokens.lock().unwrap();
        let index = tokens.iter().position(|t| t.token == config.token)?;
        let expected = tokens.remove(index);
        drop(tokens);

        let node_id = expected.node_id;
        let mut free = self.free_node_ids.lock().unwrap();
        if let Some(pos) = free.iter().position(|&id| id == node_id) {
            free.remove(pos);
        }
        drop(free);

        let ipv4 = VirtualIpv4::for_node(node_id);
        self.node_mapper.add_node(node_id, ipv4);
        Some((node_id, ipv4.0))
    }

    fn register_session(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap().push(session);
    }

    fn on_session_disconnected(&self, session: &Arc<Session>) {
        self.sessions.lock().unwrap().retain(|s| !Arc::ptr_eq(s, session));
        if let Some(node_id) = session.node_id() {
            self.node_mapper.remove_node(node_id);
            self.free_node_ids.lock().unwrap().push(node_id);
            let frame = ryu_protocol::encode(PacketType::ProxyDisconnect, &ProxyDisconnect { node_id }.to_bytes());
            if let Some(send) = self.master_send.lock().unwrap().as_ref() {
                send(&frame);
            }
        }
    }

    /// Fans `payload` out to every node the mapper says should receive it,
    /// excluding `source_node`. Node 0 (the host's own game process) is
    /// delivered locally rather than over a session socket.
    fn fan_out(&self, source_node: u8, dest: u32, packet_type: PacketType, payload: &[u8]) {
        let sessions = self.sessions.lock().unwrap();
        for target in 0..MAX_NODES {
            if !self.node_mapper.should_route(dest, u32::from(source_node), target) {
                continue;
            }
            if target == 0 {
                if let Some(deliver) = self.local_deliver.lock().unwrap().as_ref() {
                    deliver(packet_type, payload);
                }
                continue;
            }
            if let Some(session) = sessions.iter().find(|s| s.node_id() == Some(target)) {
                session.send_frame(packet_type, payload);
            }
        }
    }
}

/// TCP server hosting direct P2P connections for a local-comm session where
/// this process is the access point (node 0).
pub struct P2pHostServer {
    shared: Arc<HostShared>,
    port_mapper: Arc<dyn PortMapper>,
    running: Arc<AtomicBool>,
    private_port: Mutex<Option<u16>>,
    public_port: Mutex<Option<u16>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    lease_thread: Mutex<Option<JoinHandle<()>>>,
}

impl P2pHostServer {
    pub fn new(node_mapper: Arc<NodeMapper>, port_mapper: Arc<dyn PortMapper>) -> Self {
        Self {
            shared: Arc::new(HostShared::new(node_mapper)),
            port_mapper,
            running: Arc::new(AtomicBool::new(false)),
            private_port: Mutex::new(None),
            public_port: Mutex::new(None),
            accept_thread: Mutex::new(None),
            lease_thread: Mutex::new(None),
        }
    }

    pub fn set_master_send(&self, handler: MasterSendHandler) {
        *self.shared.master_send.lock().unwrap() = Some(handler);
    }

    pub fn set_local_deliver(&self, handler: LocalDeliverHandler) {
        *self.shared.local_deliver.lock().unwrap() = Some(handler);
    }

    pub fn add_waiting_token(&self, token: ExternalProxyToken) {
        self.shared.add_waiting_token(token);
    }

    /// Fans a frame originating from the host's own game process (node 0)
    /// out to every connected session the node mapper says should receive
    /// it. The local-comm service calls this for the host's own outbound
    /// proxy traffic, mirroring [`HostShared::fan_out`]'s treatment of
    /// session-originated frames.
    pub fn send_from_host(&self, dest: u32, packet_type: PacketType, payload: &[u8]) {
        self.shared.fan_out(0, dest, packet_type, payload);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn private_port(&self) -> Option<u16> {
        *self.private_port.lock().unwrap()
    }

    pub fn public_port(&self) -> Option<u16> {
        *self.public_port.lock().unwrap()
    }

    /// Starts listening. `preferred_port` of `0` tries each port in
    /// `P2P_PORT_BASE..P2P_PORT_BASE + P2P_PORT_RANGE` in turn, matching the
    /// original's `Start(port = 0)` contract; any other value binds exactly
    /// that port.
    pub fn start(&self, preferred_port: u16) -> Result<u16, ConnectionError> {
        let listener = if preferred_port != 0 {
            TcpListener::bind(("0.0.0.0", preferred_port)).map_err(|_| ConnectionError::ConnectFailed)?
        } else {
            (0..P2P_PORT_RANGE)
                .find_map(|offset| TcpListener::bind(("0.0.0.0", P2P_PORT_BASE + offset)).ok())
                .ok_or(ConnectionError::ConnectFailed)?
        };
        listener.set_nonblocking(true).map_err(|_| ConnectionError::ConnectFailed)?;
        let port = listener.local_addr().map_err(|_| ConnectionError::ConnectFailed)?.port();
        *self.private_port.lock().unwrap() = Some(port);
        self.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || accept_loop(listener, shared, running));
        *self.accept_thread.lock().unwrap() = Some(handle);
        Ok(port)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.lease_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for session in self.shared.sessions.lock().unwrap().drain(..) {
            let _ = session.stream.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
        if let Some(public_port) = self.public_port.lock().unwrap().take() {
            self.port_mapper.delete_port_mapping(public_port);
        }
        *self.private_port.lock().unwrap() = None;
    }

    /// Opens a public port mapping via the configured [`PortMapper`] and, on
    /// success, starts a lease-renewal thread. Failure is non-fatal (design
    /// 4.17): the host remains reachable to peers that can route directly.
    pub fn nat_punch(&self) -> Option<u16> {
        let private_port = self.private_port()?;
        if !self.port_mapper.discover() {
            return None;
        }
        let external = (0..P2P_PORT_RANGE)
            .map(|offset| P2P_PORT_BASE + offset)
            .find(|&candidate| {
                self.port_mapper.add_port_mapping(
                    private_port,
                    candidate,
                    "ryu-ldn p2p",
                    crate::port_mapper::PORT_LEASE_DURATION_SECS as u32,
                )
            })?;
        *self.public_port.lock().unwrap() = Some(external);

        let port_mapper = self.port_mapper.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            let renew_every = Duration::from_secs(PORT_LEASE_RENEW_SECS);
            let mut last_renew = Instant::now();
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
                if last_renew.elapsed() >= renew_every {
                    port_mapper.refresh_port_mapping(private_port, external, "ryu-ldn p2p");
                    last_renew = Instant::now();
                }
            }
        });
        *self.lease_thread.lock().unwrap() = Some(handle);
        Some(external)
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<HostShared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nodelay(true).ok();
                let shared = shared.clone();
                let running = running.clone();
                std::thread::spawn(move || run_session(stream, shared, running));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => break,
        }
    }
}

fn run_session(stream: TcpStream, shared: Arc<HostShared>, running: Arc<AtomicBool>) {
    stream.set_read_timeout(Some(Duration::from_millis(100))).ok();
    let session = Arc::new(Session {
        stream: Mutex::new(stream.try_clone().expect("clone session stream")),
        node_id: Mutex::new(None),
        virtual_ip: Mutex::new(None),
        authenticated: AtomicBool::new(false),
    });
    shared.register_session(session.clone());

    let mut reader = stream;
    let auth_deadline = Instant::now() + AUTH_WAIT;
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !session.authenticated.load(Ordering::SeqCst) && Instant::now() >= auth_deadline {
            break;
        }
        match read_frame(&mut reader) {
            Ok(Some((header, payload))) => {
                if !handle_frame(&session, &shared, header, &payload) {
                    break;
                }
            }
            Ok(None) => continue,
            Err(_) => break,
        }
    }
    shared.on_session_disconnected(&session);
}

/// Reads one frame with a short per-read timeout, returning `Ok(None)` on a
/// timeout so the caller can re-check its deadlines, and `Err` on a hard
/// socket failure or clean close.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut header_buf = [0u8; HEADER_LEN];
    if let Err(e) = stream.read_exact(&mut header_buf) {
        if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
            return Ok(None);
        }
        return Err(e);
    }
    let header = FrameHeader::decode(&header_buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame header"))?;
    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        stream.set_read_timeout(Some(Duration::from_secs(2))).ok();
        stream.read_exact(&mut payload)?;
        stream.set_read_timeout(Some(Duration::from_millis(100))).ok();
    }
    Ok(Some((header, payload)))
}

/// Processes one decoded frame for `session`. Returns `false` when the
/// session should be torn down.
fn handle_frame(session: &Arc<Session>, shared: &Arc<HostShared>, header: FrameHeader, payload: &[u8]) -> bool {
    let Some(packet_type) = header.packet_type else { return true };
    if !packet_type.accepts_len(payload.len()) {
        return true;
    }

    if !session.authenticated.load(Ordering::SeqCst) {
        return match packet_type {
            PacketType::ExternalProxyConfig => match ExternalProxyConfig::from_bytes(payload) {
                Ok(config) => match shared.try_register(config) {
                    Some((node_id, assigned_ip)) => {
                        *session.node_id.lock().unwrap() = Some(node_id);
                        *session.virtual_ip.lock().unwrap() = Some(assigned_ip);
                        session.authenticated.store(true, Ordering::SeqCst);
                        session.send_frame(PacketType::ProxyConfig, &ProxyConfig { assigned_ip, node_id }.to_bytes());
                        true
                    }
                    None => {
                        session.send_frame(PacketType::Reject, &Reject { reason_code: 0 }.to_bytes());
                        false
                    }
                },
                Err(_) => false,
            },
            _ => true,
        };
    }

    let source_node = match session.node_id() {
        Some(id) => id,
        None => return false,
    };

    match packet_type {
        PacketType::ProxyData => {
            if let Ok(mut data) = ProxyData::from_bytes(payload) {
                if let Some(vip) = *session.virtual_ip.lock().unwrap() {
                    data.header.src_ip = vip;
                }
                let dest = node_id_for_ip(data.header.dst_ip);
                shared.fan_out(source_node, dest, PacketType::ProxyData, &data.to_bytes());
            }
        }
        PacketType::ProxyConnect => {
            if let Ok(mut request) = ProxyConnect::from_bytes(payload) {
                if let Some(vip) = *session.virtual_ip.lock().unwrap() {
                    request.header.src_ip = vip;
                }
                let dest = node_id_for_ip(request.header.dst_ip);
                shared.fan_out(source_node, dest, PacketType::ProxyConnect, &request.to_bytes());
            }
        }
        PacketType::ProxyConnectReply => {
            if let Ok(mut reply) = ProxyConnectReply::from_bytes(payload) {
                if let Some(vip) = *session.virtual_ip.lock().unwrap() {
                    reply.header.src_ip = vip;
                }
                let dest = node_id_for_ip(reply.header.dst_ip);
                shared.fan_out(source_node, dest, PacketType::ProxyConnectReply, &reply.to_bytes());
            }
        }
        PacketType::ProxyDisconnect => {
            let frame = ryu_protocol::encode(PacketType::ProxyDisconnect, payload);
            if let Some(send) = shared.master_send.lock().unwrap().as_ref() {
                send(&frame);
            }
        }
        _ => {}
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_mapper::NullPortMapper;
    use std::sync::atomic::AtomicU16;

    fn next_test_port() -> u16 {
        static NEXT: AtomicU16 = AtomicU16::new(41_500);
        NEXT.fetch_add(1, Ordering::SeqCst)
    }

    fn write_frame(stream: &mut TcpStream, packet_type: PacketType, payload: &[u8]) {
        let frame = ryu_protocol::encode(packet_type, payload);
        stream.write_all(&frame).unwrap();
    }

    fn read_one(stream: &mut TcpStream) -> (PacketType, Vec<u8>) {
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut header_buf = [0u8; HEADER_LEN];
        stream.read_exact(&mut header_buf).unwrap();
        let header = FrameHeader::decode(&header_buf).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload).unwrap();
        (header.packet_type.unwrap(), payload)
    }

    #[test]
    fn registered_token_is_accepted_and_assigned_virtual_ip() {
        let node_mapper = Arc::new(NodeMapper::new());
        let host = P2pHostServer::new(node_mapper, Arc::new(NullPortMapper));
        let port = host.start(next_test_port()).unwrap();
        host.add_waiting_token(ExternalProxyToken { token: [9u8; 16], node_id: 3 });

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write_frame(&mut client, PacketType::ExternalProxyConfig, &ExternalProxyConfig { token: [9u8; 16] }.to_bytes());
        let (packet_type, payload) = read_one(&mut client);
        assert_eq!(packet_type, PacketType::ProxyConfig);
        let config = ProxyConfig::from_bytes(&payload).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.assigned_ip, VirtualIpv4::for_node(3).0);
        host.stop();
    }

    #[test]
    fn unknown_token_is_rejected() {
        let node_mapper = Arc::new(NodeMapper::new());
        let host = P2pHostServer::new(node_mapper, Arc::new(NullPortMapper));
        let port = host.start(next_test_port()).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write_frame(&mut client, PacketType::ExternalProxyConfig, &ExternalProxyConfig { token: [1u8; 16] }.to_bytes());
        let (packet_type, _) = read_one(&mut client);
        assert_eq!(packet_type, PacketType::Reject);
        host.stop();
    }

    #[test]
    fn broadcast_proxy_data_reaches_other_session_with_rewritten_source() {
        let node_mapper = Arc::new(NodeMapper::new());
        node_mapper.add_node(0, VirtualIpv4::for_node(0));
        let host = P2pHostServer::new(node_mapper, Arc::new(NullPortMapper));
        let port = host.start(next_test_port()).unwrap();
        host.add_waiting_token(ExternalProxyToken { token: [1u8; 16], node_id: 1 });
        host.add_waiting_token(ExternalProxyToken { token: [2u8; 16], node_id: 2 });

        let mut client_a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write_frame(&mut client_a, PacketType::ExternalProxyConfig, &ExternalProxyConfig { token: [1u8; 16] }.to_bytes());
        read_one(&mut client_a);

        let mut client_b = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write_frame(&mut client_b, PacketType::ExternalProxyConfig, &ExternalProxyConfig { token: [2u8; 16] }.to_bytes());
        read_one(&mut client_b);

        let data = ProxyData {
            header: ryu_protocol::payload::ProxyAddressHeader {
                src_ip: 0,
                src_port: 7000,
                dst_ip: VirtualIpv4::broadcast().0,
                dst_port: 8000,
                protocol: 17,
            },
            payload: vec![5, 6, 7],
        };
        write_frame(&mut client_a, PacketType::ProxyData, &data.to_bytes());

        let (packet_type, payload) = read_one(&mut client_b);
        assert_eq!(packet_type, PacketType::ProxyData);
        let received = ProxyData::from_bytes(&payload).unwrap();
        assert_eq!(received.header.src_ip, VirtualIpv4::for_node(1).0);
        assert_eq!(received.payload, vec![5, 6, 7]);
        host.stop();
    }
}

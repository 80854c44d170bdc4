//! Virtual socket registry (design 4.11), grounded on
//! `proxy_socket_manager.hpp`'s `ProxySocketManager`: a single registry
//! mapping file descriptors to [`VirtualSocket`] handles, fronting the
//! shared [`EphemeralPortPool`] and the outbound send callbacks the BSD
//! interceptor and packet dispatcher install.
//!
//! The original is a `GetInstance()` singleton because there is exactly one
//! BSD service being intercepted per process; here ownership is expressed
//! normally, with the caller holding the registry behind an `Arc` (see
//! [`crate::shared_state`]) instead of baking in global statics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ryu_protocol::node::VirtualIpv4;

use crate::port_pool::{EphemeralPortPool, Protocol};
use crate::virtual_socket::{SocketKind, SocketState, VirtualAddr, VirtualSocket};

pub const MAX_PROXY_SOCKETS: usize = 64;

pub type Fd = i32;
pub const INVALID_FD: Fd = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered,
    CapacityReached,
    NotFound,
}

/// Invoked when a proxy socket needs to hand payload bytes off to the relay
/// link. Returns whether the send was accepted.
pub type SendDataFn = Box<dyn Fn(VirtualAddr, VirtualAddr, Protocol, &[u8]) -> bool + Send + Sync>;

/// Invoked when a TCP proxy socket's `connect()` needs to kick off the
/// `ProxyConnect` handshake over the relay link.
pub type SendConnectFn = Box<dyn Fn(VirtualAddr, VirtualAddr) -> bool + Send + Sync>;

struct Inner {
    sockets: HashMap<Fd, Arc<VirtualSocket>>,
    local_ip: Option<VirtualIpv4>,
    send_data: Option<SendDataFn>,
    send_connect: Option<SendConnectFn>,
}

/// Central fd → [`VirtualSocket`] registry shared between the BSD
/// interceptor, the packet dispatcher, and the P2P subsystems.
pub struct SocketRegistry {
    inner: Mutex<Inner>,
    ports: EphemeralPortPool,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sockets: HashMap::new(),
                local_ip: None,
                send_data: None,
                send_connect: None,
            }),
            ports: EphemeralPortPool::new(),
        }
    }

    pub fn create_socket(
        &self,
        fd: Fd,
        kind: SocketKind,
        protocol: Protocol,
    ) -> Result<Arc<VirtualSocket>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sockets.contains_key(&fd) {
            return Err(RegistryError::AlreadyRegistered);
        }
        if inner.sockets.len() >= MAX_PROXY_SOCKETS {
            return Err(RegistryError::CapacityReached);
        }
        let socket = Arc::new(VirtualSocket::new(kind, protocol));
        inner.sockets.insert(fd, socket.clone());
        Ok(socket)
    }

    pub fn get(&self, fd: Fd) -> Option<Arc<VirtualSocket>> {
        self.inner.lock().unwrap().sockets.get(&fd).cloned()
    }

    pub fn is_proxy_socket(&self, fd: Fd) -> bool {
        self.inner.lock().unwrap().sockets.contains_key(&fd)
    }

    /// Removes and closes the socket, releasing any port it held bound.
    pub fn close_socket(&self, fd: Fd) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(socket) = inner.sockets.remove(&fd) else { return false };
        if let Some(addr) = socket.local_addr() {
            self.ports.release(addr.port, socket.protocol());
        }
        socket.close();
        true
    }

    /// Registers an already-constructed socket (e.g. one popped from a
    /// listener's accept queue) under a new fd, as `Accept` does in the
    /// original when it hands the game a freshly allocated descriptor.
    pub fn adopt(&self, fd: Fd, socket: Arc<VirtualSocket>) {
        self.inner.lock().unwrap().sockets.insert(fd, socket);
    }

    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for socket in inner.sockets.values() {
            if let Some(addr) = socket.local_addr() {
                self.ports.release(addr.port, socket.protocol());
            }
            socket.close();
        }
        inner.sockets.clear();
    }

    pub fn allocate_port(&self, protocol: Protocol) -> Option<u16> {
        self.ports.allocate_any(protocol)
    }

    pub fn reserve_port(&self, port: u16, protocol: Protocol) -> bool {
        self.ports.allocate_specific(port, protocol)
    }

    pub fn release_port(&self, port: u16, protocol: Protocol) {
        self.ports.release(port, protocol);
    }

    pub fn available_port_count(&self, protocol: Protocol) -> usize {
        self.ports.available_count(protocol)
    }

    pub fn set_local_ip(&self, ip: VirtualIpv4) {
        self.inner.lock().unwrap().local_ip = Some(ip);
    }

    pub fn local_ip(&self) -> Option<VirtualIpv4> {
        self.inner.lock().unwrap().local_ip
    }

    pub fn active_socket_count(&self) -> usize {
        self.inner.lock().unwrap().sockets.len()
    }

    pub fn set_send_data_callback(&self, f: SendDataFn) {
        self.inner.lock().unwrap().send_data = Some(f);
    }

    pub fn set_send_connect_callback(&self, f: SendConnectFn) {
        self.inner.lock().unwrap().send_connect = Some(f);
    }

    /// Delivers `data` through the registered send callback, used by
    /// `VirtualSocket::send`/`send_to` implementations in the interceptor.
    pub fn send_proxy_data(
        &self,
        from: VirtualAddr,
        to: VirtualAddr,
        protocol: Protocol,
        data: &[u8],
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.send_data {
            Some(f) => f(from, to, protocol, data),
            None => false,
        }
    }

    pub fn send_proxy_connect(&self, from: VirtualAddr, to: VirtualAddr) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.send_connect {
            Some(f) => f(from, to),
            None => false,
        }
    }

    /// Routes an inbound `ProxyData` payload to whichever registered socket
    /// is bound to `dest` for `protocol`, queuing it there. Mirrors
    /// `RouteIncomingData`'s linear scan over the registry.
    pub fn route_incoming_data(
        &self,
        dest: VirtualAddr,
        from: VirtualAddr,
        protocol: Protocol,
        data: &[u8],
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        for socket in inner.sockets.values() {
            let Some(local) = socket.local_addr() else { continue };
            let ip_matches = local.ip == dest.ip || local.ip == VirtualIpv4(0);
            if socket.protocol() == protocol && local.port == dest.port && ip_matches {
                return socket.push_incoming(data, from).is_ok();
            }
        }
        false
    }

    /// Inbound `ProxyConnect`: finds the `Listening` stream socket bound to
    /// `dest`, synthesizes a connected socket for the peer and queues it for
    /// `Accept`. The return value becomes the wire `ProxyConnectReply`'s
    /// `accepted` flag.
    pub fn route_connect_request(&self, dest: VirtualAddr, from: VirtualAddr) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(listener) = inner.sockets.values().find(|s| {
            s.kind() == SocketKind::Stream && s.state() == SocketState::Listening && s.local_addr() == Some(dest)
        }) else {
            return false;
        };
        let accepted = Arc::new(VirtualSocket::new(SocketKind::Stream, Protocol::Tcp));
        let _ = accepted.bind(dest);
        let _ = accepted.connect(from);
        listener.push_accept(accepted).is_ok()
    }

    /// Inbound `ProxyConnectReply`: completes a pending outbound `Connect`
    /// on the stream socket bound to `dest` and pointed at `from`. A
    /// rejection leaves the socket as the caller left it; the caller is
    /// expected to notice it never reached `Connected` and give up.
    pub fn route_connect_response(&self, dest: VirtualAddr, from: VirtualAddr, accepted: bool) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(socket) = inner.sockets.values().find(|s| {
            s.kind() == SocketKind::Stream && s.local_addr() == Some(dest) && s.remote_addr() == Some(from)
        }) else {
            return false;
        };
        if accepted {
            let _ = socket.connect(from);
        }
        true
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(octet: u8, port: u16) -> VirtualAddr {
        VirtualAddr { ip: VirtualIpv4::for_node(octet), port }
    }

    #[test]
    fn create_socket_rejects_duplicate_fd() {
        let registry = SocketRegistry::new();
        registry.create_socket(3, SocketKind::Dgram, Protocol::Udp).unwrap();
        assert_eq!(
            registry.create_socket(3, SocketKind::Dgram, Protocol::Udp).unwrap_err(),
            RegistryError::AlreadyRegistered
        );
    }

    #[test]
    fn close_socket_releases_its_bound_port() {
        let registry = SocketRegistry::new();
        let socket = registry.create_socket(5, SocketKind::Dgram, Protocol::Udp).unwrap();
        let port = registry.allocate_port(Protocol::Udp).unwrap();
        socket.bind(addr(0, port)).unwrap();
        assert!(registry.ports.is_allocated(port, Protocol::Udp));
        registry.close_socket(5);
        assert!(!registry.is_proxy_socket(5));
        assert!(registry.reserve_port(port, Protocol::Udp));
    }

    #[test]
    fn route_incoming_data_matches_bound_socket() {
        let registry = SocketRegistry::new();
        let socket = registry.create_socket(7, SocketKind::Dgram, Protocol::Udp).unwrap();
        socket.bind(addr(0, 4000)).unwrap();
        assert!(registry.route_incoming_data(addr(0, 4000), addr(1, 5000), Protocol::Udp, &[9]));
        assert_eq!(socket.try_recv().unwrap().data, vec![9]);
        assert!(!registry.route_incoming_data(addr(0, 4001), addr(1, 5000), Protocol::Udp, &[9]));
    }

    #[test]
    fn route_incoming_data_matches_any_local_ip() {
        let registry = SocketRegistry::new();
        let socket = registry.create_socket(8, SocketKind::Dgram, Protocol::Udp).unwrap();
        socket.bind(VirtualAddr { ip: VirtualIpv4(0), port: 4000 }).unwrap();
        assert!(registry.route_incoming_data(addr(3, 4000), addr(1, 5000), Protocol::Udp, &[9]));
        assert_eq!(socket.try_recv().unwrap().data, vec![9]);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let registry = SocketRegistry::new();
        for fd in 0..MAX_PROXY_SOCKETS as Fd {
            registry.create_socket(fd, SocketKind::Dgram, Protocol::Udp).unwrap();
        }
        assert_eq!(
            registry
                .create_socket(MAX_PROXY_SOCKETS as Fd, SocketKind::Dgram, Protocol::Udp)
                .unwrap_err(),
            RegistryError::CapacityReached
        );
    }

    #[test]
    fn send_callbacks_are_invoked_with_registered_closures() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let registry = SocketRegistry::new();
        let called = StdArc::new(AtomicBool::new(false));
        let called_cb = called.clone();
        registry.set_send_data_callback(Box::new(move |_, _, _, _| {
            called_cb.store(true, Ordering::SeqCst);
            true
        }));
        assert!(registry.send_proxy_data(addr(0, 1), addr(1, 2), Protocol::Udp, &[1, 2, 3]));
        assert!(called.load(Ordering::SeqCst));
    }
}

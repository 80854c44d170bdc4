//! BSD socket interceptor (design 4.12), grounded on
//! `bsd_mitm_service.hpp`/`.cpp`: for every socket call, decide whether the
//! destination is in the LDN virtual subnet and route accordingly — real
//! traffic passes through to the real `bsd:u` service untouched, LDN
//! traffic is diverted into a [`VirtualSocket`] from the
//! [`SocketRegistry`].
//!
//! The real socket stack is abstracted behind [`RealSocketLayer`] rather
//! than calling OS sockets directly, mirroring `socket.hpp`'s own
//! native/POSIX split ("Provides a platform-agnostic TCP socket
//! interface... On Switch: libnx BSD sockets, On host: POSIX sockets for
//! testing") and the same native/wasm split the relay client's transport
//! takes. `Socket`/`SocketExempt` are treated identically (design's Open
//! Question #2): both are plain fd allocations that become proxy sockets
//! only once `Bind`/`Connect` names an LDN address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ryu_protocol::node::is_ldn_address;

use crate::port_pool::Protocol;
use crate::shared_state::SharedState;
use crate::socket_registry::{Fd, SocketRegistry};
use crate::virtual_socket::{SocketKind, VirtualAddr, VirtualSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// Abstraction over the real (non-LDN) socket stack. Production code backs
/// this with actual OS sockets; tests substitute an in-memory fake.
pub trait RealSocketLayer: Send + Sync {
    fn socket(&self, domain: i32, kind: i32, protocol: i32) -> std::io::Result<Fd>;
    fn bind(&self, fd: Fd, ip: u32, port: u16) -> std::io::Result<()>;
    fn connect(&self, fd: Fd, ip: u32, port: u16) -> std::io::Result<()>;
    fn send(&self, fd: Fd, data: &[u8]) -> std::io::Result<usize>;
    fn recv(&self, fd: Fd, buf: &mut [u8]) -> std::io::Result<usize>;
    fn listen(&self, fd: Fd, backlog: i32) -> std::io::Result<()>;
    fn accept(&self, fd: Fd) -> std::io::Result<(Fd, u32, u16)>;
    fn close(&self, fd: Fd) -> std::io::Result<()>;
    fn shutdown(&self, fd: Fd, how: ShutdownHow) -> std::io::Result<()>;
    /// Zero-timeout readiness check, used by the `poll`/`select` merge.
    fn is_readable(&self, fd: Fd) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptError {
    Real(std::io::ErrorKind),
    NotAProxySocket,
    WrongKind,
    /// Ephemeral port pool exhausted for the socket's protocol (design 4.9/4.12 → `EADDRINUSE`).
    PortExhausted,
    /// Peer tore down the connection (design 4.17 → `ECONNRESET`).
    ConnectionReset,
    /// Send/recv attempted on a socket with no remote address (→ `ENOTCONN`).
    NotConnected,
    /// Payload exceeds `PROXY_SOCKET_MAX_PAYLOAD` (→ `EMSGSIZE`).
    MessageTooLarge,
    /// Send after the write half was shut down (→ `EPIPE`).
    Pipe,
    /// Non-blocking recv found nothing queued (→ `EAGAIN`).
    WouldBlock,
}

/// Standard negative-errno values the virtual side maps its errors to
/// (design 4.12): "Errors from the virtual side are mapped to standard
/// negative-errno values (EAGAIN, ECONNRESET, ENOTCONN, EADDRINUSE,
/// EMSGSIZE, EPIPE)."
pub mod errno {
    pub const EAGAIN: i32 = -11;
    pub const EPIPE: i32 = -32;
    pub const ENOTCONN: i32 = -107;
    pub const ECONNRESET: i32 = -104;
    pub const EADDRINUSE: i32 = -98;
    pub const EMSGSIZE: i32 = -90;
}

impl InterceptError {
    /// Maps this error to the negative-errno value a caller expects back
    /// from the intercepted BSD call.
    pub fn to_errno(self) -> i32 {
        match self {
            InterceptError::PortExhausted => errno::EADDRINUSE,
            InterceptError::ConnectionReset => errno::ECONNRESET,
            InterceptError::NotConnected | InterceptError::NotAProxySocket | InterceptError::WrongKind => {
                errno::ENOTCONN
            }
            InterceptError::MessageTooLarge => errno::EMSGSIZE,
            InterceptError::Pipe => errno::EPIPE,
            InterceptError::WouldBlock => errno::EAGAIN,
            InterceptError::Real(kind) => match kind {
                std::io::ErrorKind::WouldBlock => errno::EAGAIN,
                std::io::ErrorKind::ConnectionReset => errno::ECONNRESET,
                std::io::ErrorKind::NotConnected => errno::ENOTCONN,
                std::io::ErrorKind::AddrInUse => errno::EADDRINUSE,
                std::io::ErrorKind::BrokenPipe => errno::EPIPE,
                _ => errno::ENOTCONN,
            },
        }
    }
}

/// Tracks the socket/protocol a plain `socket()` call requested, so that a
/// later `Bind`/`Connect` naming an LDN address can promote the same fd
/// into a proxy socket with matching semantics.
struct PendingSocket {
    kind: SocketKind,
    protocol: Protocol,
}

pub struct BsdInterceptor {
    real: Arc<dyn RealSocketLayer>,
    registry: Arc<SocketRegistry>,
    shared: Arc<SharedState>,
    pending: Mutex<HashMap<Fd, PendingSocket>>,
}

fn socket_kind_and_protocol(type_: i32, protocol: i32) -> (SocketKind, Protocol) {
    const SOCK_DGRAM: i32 = 2;
    const IPPROTO_UDP: i32 = 17;
    if type_ == SOCK_DGRAM || protocol == IPPROTO_UDP {
        (SocketKind::Dgram, Protocol::Udp)
    } else {
        (SocketKind::Stream, Protocol::Tcp)
    }
}

impl BsdInterceptor {
    pub fn new(real: Arc<dyn RealSocketLayer>, registry: Arc<SocketRegistry>, shared: Arc<SharedState>) -> Self {
        Self { real, registry, shared, pending: Mutex::new(HashMap::new()) }
    }

    /// Design 4.12 step 1: every intercepted call first consults the shared
    /// runtime state for whether the calling process currently owns the
    /// local-comm session. A process that never sees `ldn_pid` set never has
    /// any fd promoted to virtual, so this also protects `bind`/`connect`
    /// from classifying an LDN-shaped address as virtual for a process that
    /// isn't the tunneled one.
    fn is_tunneled(&self) -> bool {
        self.shared.is_process_tunneled(std::process::id())
    }

    /// `Socket`/`SocketExempt`: always forwarded to the real stack (design's
    /// Open Question #2 — the distinction is not preserved across the
    /// virtualization boundary). Whether it ends up proxied is decided
    /// later, at `Bind`/`Connect`, and only for a tunneled process.
    pub fn socket(&self, domain: i32, type_: i32, protocol: i32) -> Result<Fd, InterceptError> {
        let fd = self.real.socket(domain, type_, protocol).map_err(|e| InterceptError::Real(e.kind()))?;
        if self.is_tunneled() {
            let (kind, proto) = socket_kind_and_protocol(type_, protocol);
            self.pending.lock().unwrap().insert(fd, PendingSocket { kind, protocol: proto });
        }
        Ok(fd)
    }

    fn promote_to_proxy(&self, fd: Fd) -> Option<Arc<VirtualSocket>> {
        if let Some(existing) = self.registry.get(fd) {
            return Some(existing);
        }
        let pending = self.pending.lock().unwrap().remove(&fd)?;
        self.registry.create_socket(fd, pending.kind, pending.protocol).ok()
    }

    /// Port pool exhaustion surfaces as `EADDRINUSE` (design §4.17's failure
    /// table), never a silent fall-back to port 0.
    pub fn bind(&self, fd: Fd, ip: u32, port: u16) -> Result<(), InterceptError> {
        if self.is_tunneled() && is_ldn_address(ip) {
            let socket = self.promote_to_proxy(fd).ok_or(InterceptError::NotAProxySocket)?;
            let assigned_port = if port == 0 {
                self.registry.allocate_port(socket.protocol()).ok_or(InterceptError::PortExhausted)?
            } else if (crate::port_pool::EPHEMERAL_PORT_MIN..=crate::port_pool::EPHEMERAL_PORT_MAX).contains(&port) {
                if !self.registry.reserve_port(port, socket.protocol()) {
                    return Err(InterceptError::PortExhausted);
                }
                port
            } else {
                port
            };
            socket
                .bind(VirtualAddr { ip: ryu_protocol::node::VirtualIpv4(ip), port: assigned_port })
                .map_err(|_| InterceptError::WrongKind)
        } else {
            self.real.bind(fd, ip, port).map_err(|e| InterceptError::Real(e.kind()))
        }
    }

    pub fn connect(&self, fd: Fd, ip: u32, port: u16) -> Result<(), InterceptError> {
        if self.is_tunneled() && (is_ldn_address(ip) || self.registry.get(fd).is_some()) {
            let socket = self.promote_to_proxy(fd).ok_or(InterceptError::NotAProxySocket)?;
            let remote = VirtualAddr { ip: ryu_protocol::node::VirtualIpv4(ip), port };
            socket.connect(remote).map_err(|_| InterceptError::WrongKind)?;
            if socket.kind() == SocketKind::Stream {
                let local = socket.local_addr().unwrap_or_default();
                self.registry.send_proxy_connect(local, remote);
            }
            Ok(())
        } else {
            self.real.connect(fd, ip, port).map_err(|e| InterceptError::Real(e.kind()))
        }
    }

    pub fn send(&self, fd: Fd, data: &[u8]) -> Result<usize, InterceptError> {
        match self.registry.get(fd) {
            Some(socket) => {
                if data.len() > crate::virtual_socket::MAX_PAYLOAD {
                    return Err(InterceptError::MessageTooLarge);
                }
                if socket.is_write_shutdown() {
                    return Err(InterceptError::Pipe);
                }
                let from = socket.local_addr().ok_or(InterceptError::NotConnected)?;
                let to = socket.remote_addr().ok_or(InterceptError::NotConnected)?;
                if self.registry.send_proxy_data(from, to, socket.protocol(), data) {
                    Ok(data.len())
                } else {
                    Err(InterceptError::ConnectionReset)
                }
            }
            None => self.real.send(fd, data).map_err(|e| InterceptError::Real(e.kind())),
        }
    }

    pub fn send_to(&self, fd: Fd, data: &[u8], dest: VirtualAddr) -> Result<usize, InterceptError> {
        match self.registry.get(fd) {
            Some(socket) => {
                if data.len() > crate::virtual_socket::MAX_PAYLOAD {
                    return Err(InterceptError::MessageTooLarge);
                }
                if socket.is_write_shutdown() {
                    return Err(InterceptError::Pipe);
                }
                let from = socket.local_addr().unwrap_or_default();
                if self.registry.send_proxy_data(from, dest, socket.protocol(), data) {
                    Ok(data.len())
                } else {
                    Err(InterceptError::ConnectionReset)
                }
            }
            None => self.real.send(fd, data).map_err(|e| InterceptError::Real(e.kind())),
        }
    }

    /// Design §4.17: `Recv` on a closed socket returns `Ok(0)`; `Recv` with
    /// no data queued while non-blocking returns `EAGAIN` rather than 0.
    pub fn recv(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, InterceptError> {
        match self.registry.get(fd) {
            Some(socket) => match socket.recv_blocking(None) {
                Some(packet) => {
                    let n = packet.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet.data[..n]);
                    Ok(n)
                }
                None if socket.state() == crate::virtual_socket::SocketState::Closed => Ok(0),
                None => Err(InterceptError::WouldBlock),
            },
            None => self.real.recv(fd, buf).map_err(|e| InterceptError::Real(e.kind())),
        }
    }

    pub fn recv_from(&self, fd: Fd, buf: &mut [u8]) -> Result<(usize, VirtualAddr), InterceptError> {
        let socket = self.registry.get(fd).ok_or(InterceptError::NotAProxySocket)?;
        match socket.recv_blocking(None) {
            Some(packet) => {
                let n = packet.data.len().min(buf.len());
                buf[..n].copy_from_slice(&packet.data[..n]);
                Ok((n, packet.from))
            }
            None if socket.state() == crate::virtual_socket::SocketState::Closed => Ok((0, VirtualAddr::default())),
            None => Err(InterceptError::WouldBlock),
        }
    }

    pub fn listen(&self, fd: Fd, backlog: i32) -> Result<(), InterceptError> {
        match self.registry.get(fd) {
            Some(socket) => socket.listen().map_err(|_| InterceptError::WrongKind),
            None => self.real.listen(fd, backlog).map_err(|e| InterceptError::Real(e.kind())),
        }
    }

    pub fn accept(&self, fd: Fd, new_fd: Fd) -> Result<(Fd, VirtualAddr), InterceptError> {
        match self.registry.get(fd) {
            Some(listener) => {
                let accepted = listener.try_accept().ok_or(InterceptError::NotAProxySocket)?;
                let from = accepted.remote_addr().unwrap_or_default();
                self.registry.adopt(new_fd, accepted);
                Ok((new_fd, from))
            }
            None => {
                let (real_fd, ip, port) =
                    self.real.accept(fd).map_err(|e| InterceptError::Real(e.kind()))?;
                Ok((real_fd, VirtualAddr { ip: ryu_protocol::node::VirtualIpv4(ip), port }))
            }
        }
    }

    pub fn close(&self, fd: Fd) -> Result<(), InterceptError> {
        if self.registry.is_proxy_socket(fd) {
            self.registry.close_socket(fd);
            Ok(())
        } else {
            self.pending.lock().unwrap().remove(&fd);
            self.real.close(fd).map_err(|e| InterceptError::Real(e.kind()))
        }
    }

    pub fn shutdown(&self, fd: Fd, how: ShutdownHow) -> Result<(), InterceptError> {
        match self.registry.get(fd) {
            Some(socket) => {
                let (r, w) = match how {
                    ShutdownHow::Read => (true, false),
                    ShutdownHow::Write => (false, true),
                    ShutdownHow::Both => (true, true),
                };
                socket.shutdown(r, w);
                Ok(())
            }
            None => self.real.shutdown(fd, how).map_err(|e| InterceptError::Real(e.kind())),
        }
    }

    /// Merged readiness check for `Select`/`Poll` (design's Open Question
    /// #3): poll the real stack first with a zero timeout, then check
    /// virtual socket readiness, rather than modeling a single unified
    /// descriptor set.
    pub fn is_readable(&self, fd: Fd) -> bool {
        match self.registry.get(fd) {
            Some(socket) => socket.has_pending_data(),
            None => self.real.is_readable(fd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct FakeReal {
        next_fd: AtomicI32,
        readable: Mutex<HashMap<Fd, bool>>,
    }

    impl FakeReal {
        fn new() -> Self {
            Self { next_fd: AtomicI32::new(100), readable: Mutex::new(HashMap::new()) }
        }
    }

    impl RealSocketLayer for FakeReal {
        fn socket(&self, _domain: i32, _kind: i32, _protocol: i32) -> std::io::Result<Fd> {
            Ok(self.next_fd.fetch_add(1, Ordering::SeqCst))
        }
        fn bind(&self, _fd: Fd, _ip: u32, _port: u16) -> std::io::Result<()> {
            Ok(())
        }
        fn connect(&self, _fd: Fd, _ip: u32, _port: u16) -> std::io::Result<()> {
            Ok(())
        }
        fn send(&self, _fd: Fd, data: &[u8]) -> std::io::Result<usize> {
            Ok(data.len())
        }
        fn recv(&self, _fd: Fd, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
        fn listen(&self, _fd: Fd, _backlog: i32) -> std::io::Result<()> {
            Ok(())
        }
        fn accept(&self, _fd: Fd) -> std::io::Result<(Fd, u32, u16)> {
            Ok((self.next_fd.fetch_add(1, Ordering::SeqCst), 0x08080808, 1234))
        }
        fn close(&self, _fd: Fd) -> std::io::Result<()> {
            Ok(())
        }
        fn shutdown(&self, _fd: Fd, _how: ShutdownHow) -> std::io::Result<()> {
            Ok(())
        }
        fn is_readable(&self, fd: Fd) -> bool {
            *self.readable.lock().unwrap().get(&fd).unwrap_or(&false)
        }
    }

    fn interceptor() -> BsdInterceptor {
        let shared = Arc::new(SharedState::new());
        shared.set_ldn_pid(Some(std::process::id()));
        BsdInterceptor::new(Arc::new(FakeReal::new()), Arc::new(SocketRegistry::new()), shared)
    }

    #[test]
    fn untunneled_process_forwards_ldn_looking_bind_to_real_stack() {
        let shared = Arc::new(SharedState::new());
        let icpt = BsdInterceptor::new(Arc::new(FakeReal::new()), Arc::new(SocketRegistry::new()), shared);
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        assert!(!icpt.registry.is_proxy_socket(fd));
    }

    #[test]
    fn non_ldn_connect_passes_through_untouched() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 1, 0).unwrap();
        icpt.connect(fd, 0x08080808, 80).unwrap();
        assert!(!icpt.registry.is_proxy_socket(fd));
    }

    #[test]
    fn ldn_bind_promotes_fd_into_proxy_socket() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        assert!(icpt.registry.is_proxy_socket(fd));
    }

    #[test]
    fn ldn_connect_without_prior_bind_also_promotes() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 1, 6).unwrap();
        icpt.connect(fd, 0x0A720002, 7000).unwrap();
        assert!(icpt.registry.is_proxy_socket(fd));
    }

    #[test]
    fn send_on_proxy_socket_invokes_registered_callback() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        icpt.connect(fd, 0x0A720002, 6000).unwrap();
        icpt.registry.set_send_data_callback(Box::new(|_, _, _, _| true));
        assert_eq!(icpt.send(fd, &[1, 2, 3]).unwrap(), 3);
    }

    #[test]
    fn send_after_write_shutdown_returns_epipe() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        icpt.connect(fd, 0x0A720002, 6000).unwrap();
        icpt.registry.set_send_data_callback(Box::new(|_, _, _, _| true));
        icpt.shutdown(fd, ShutdownHow::Write).unwrap();
        assert_eq!(icpt.send(fd, &[1]).unwrap_err().to_errno(), errno::EPIPE);
    }

    #[test]
    fn recv_while_non_blocking_and_empty_returns_eagain() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        let socket = icpt.registry.get(fd).unwrap();
        socket.set_non_blocking(true);
        let mut buf = [0u8; 16];
        assert_eq!(icpt.recv(fd, &mut buf).unwrap_err().to_errno(), errno::EAGAIN);
    }

    #[test]
    fn recv_on_closed_socket_returns_zero() {
        let icpt = interceptor();
        let fd = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd, 0x0A720001, 5000).unwrap();
        let socket = icpt.registry.get(fd).unwrap();
        socket.set_non_blocking(true);
        socket.close();
        let mut buf = [0u8; 16];
        assert_eq!(icpt.recv(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn bind_specific_port_twice_reports_port_exhausted() {
        let icpt = interceptor();
        let fd_a = icpt.socket(2, 2, 17).unwrap();
        icpt.bind(fd_a, 0x0A720001, 5000).unwrap();
        let fd_b = icpt.socket(2, 2, 17).unwrap();
        let err = icpt.bind(fd_b, 0x0A720002, 5000).unwrap_err();
        assert_eq!(err, InterceptError::PortExhausted);
        assert_eq!(err.to_errno(), errno::EADDRINUSE);
    }
}

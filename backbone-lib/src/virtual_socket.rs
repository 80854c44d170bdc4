//! Virtual socket (design 4.10), grounded on `proxy_socket.hpp`/`.cpp`'s
//! `ProxySocket`: a BSD-socket-shaped handle that never touches a real
//! network, backed by a bounded receive queue and (for `Stream` sockets) an
//! accept queue, with a condvar for blocking `recv`/`accept` semantics.
//!
//! Queue overflow here is drop-**oldest** (`ProxySocket`'s documented "UDP
//! behavior"), which is a deliberate contrast with the single shared
//! [`crate::proxy_buffer::ProxyReceiveBuffer`]'s drop-**new** policy: that
//! buffer sits in front of the whole session and favors not silently
//! discarding a packet a socket hasn't been created for yet, while a
//! per-socket queue favors keeping the most recent data once a game is
//! actively reading a stream.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ryu_protocol::node::VirtualIpv4;

use crate::port_pool::Protocol;

pub const MAX_QUEUE_SIZE: usize = 64;
pub const MAX_PAYLOAD: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Connected,
    Listening,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualAddr {
    pub ip: VirtualIpv4,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub data: Vec<u8>,
    pub from: VirtualAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    PayloadTooLarge,
    NotBound,
    NotConnected,
    NotListening,
    WrongKind,
    AlreadyClosed,
}

struct Inner {
    state: SocketState,
    non_blocking: bool,
    shutdown_read: bool,
    shutdown_write: bool,
    local_addr: Option<VirtualAddr>,
    remote_addr: Option<VirtualAddr>,
    receive_queue: VecDeque<ReceivedPacket>,
    accept_queue: VecDeque<Arc<VirtualSocket>>,
}

/// A virtual BSD-socket-shaped handle. Held behind `Arc` by the socket
/// registry and by any accept queue it is placed into.
pub struct VirtualSocket {
    kind: SocketKind,
    protocol: Protocol,
    inner: Mutex<Inner>,
    data_available: Condvar,
}

impl VirtualSocket {
    pub fn new(kind: SocketKind, protocol: Protocol) -> Self {
        Self {
            kind,
            protocol,
            inner: Mutex::new(Inner {
                state: SocketState::Created,
                non_blocking: false,
                shutdown_read: false,
                shutdown_write: false,
                local_addr: None,
                remote_addr: None,
                receive_queue: VecDeque::new(),
                accept_queue: VecDeque::new(),
            }),
            data_available: Condvar::new(),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().unwrap().state
    }

    pub fn is_non_blocking(&self) -> bool {
        self.inner.lock().unwrap().non_blocking
    }

    pub fn set_non_blocking(&self, non_blocking: bool) {
        self.inner.lock().unwrap().non_blocking = non_blocking;
    }

    pub fn local_addr(&self) -> Option<VirtualAddr> {
        self.inner.lock().unwrap().local_addr
    }

    pub fn remote_addr(&self) -> Option<VirtualAddr> {
        self.inner.lock().unwrap().remote_addr
    }

    pub fn bind(&self, addr: VirtualAddr) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SocketState::Closed {
            return Err(SocketError::AlreadyClosed);
        }
        inner.local_addr = Some(addr);
        if inner.state == SocketState::Created {
            inner.state = SocketState::Bound;
        }
        Ok(())
    }

    /// For `Dgram` sockets this only records the default destination; for
    /// `Stream` sockets it is the caller's job to have already completed a
    /// `ProxyConnect`/`ProxyConnectReply` handshake before calling this.
    pub fn connect(&self, addr: VirtualAddr) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SocketState::Closed {
            return Err(SocketError::AlreadyClosed);
        }
        inner.remote_addr = Some(addr);
        inner.state = SocketState::Connected;
        Ok(())
    }

    pub fn listen(&self) -> Result<(), SocketError> {
        if self.kind != SocketKind::Stream {
            return Err(SocketError::WrongKind);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.local_addr.is_none() {
            return Err(SocketError::NotBound);
        }
        inner.state = SocketState::Listening;
        Ok(())
    }

    /// Queues an inbound packet that arrived addressed to this socket.
    /// Drops the oldest entry on overflow, matching `ProxySocket`'s
    /// documented UDP-style behavior for both protocols.
    pub fn push_incoming(&self, data: &[u8], from: VirtualAddr) -> Result<(), SocketError> {
        if data.len() > MAX_PAYLOAD {
            return Err(SocketError::PayloadTooLarge);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown_read {
            // Shutdown-read prevents further enqueue from being visible to
            // Recv (design 4.10); silently discard rather than error, since
            // the sender has no way to observe a one-sided local shutdown.
            return Ok(());
        }
        if inner.receive_queue.len() >= MAX_QUEUE_SIZE {
            inner.receive_queue.pop_front();
        }
        inner.receive_queue.push_back(ReceivedPacket { data: data.to_vec(), from });
        drop(inner);
        self.data_available.notify_all();
        Ok(())
    }

    /// Non-blocking pop of the oldest queued packet.
    pub fn try_recv(&self) -> Option<ReceivedPacket> {
        self.inner.lock().unwrap().receive_queue.pop_front()
    }

    /// Non-consuming look at the oldest queued packet.
    pub fn peek(&self) -> Option<ReceivedPacket> {
        self.inner.lock().unwrap().receive_queue.front().cloned()
    }

    /// Blocks until data is available or `timeout` elapses (`None` waits
    /// indefinitely). Honors non-blocking mode by never waiting.
    pub fn recv_blocking(&self, timeout: Option<Duration>) -> Option<ReceivedPacket> {
        let mut inner = self.inner.lock().unwrap();
        if inner.non_blocking {
            return inner.receive_queue.pop_front();
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(packet) = inner.receive_queue.pop_front() {
                return Some(packet);
            }
            if inner.state == SocketState::Closed {
                return None;
            }
            inner = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, timed_out) =
                        self.data_available.wait_timeout(inner, remaining).unwrap();
                    if timed_out.timed_out() && guard.receive_queue.is_empty() {
                        return None;
                    }
                    guard
                }
                None => self.data_available.wait(inner).unwrap(),
            };
        }
    }

    pub fn has_pending_data(&self) -> bool {
        !self.inner.lock().unwrap().receive_queue.is_empty()
    }

    pub fn pending_data_len(&self) -> usize {
        self.inner.lock().unwrap().receive_queue.iter().map(|p| p.data.len()).sum()
    }

    /// Places an accepted connection's socket into the accept queue of a
    /// listening socket.
    pub fn push_accept(&self, socket: Arc<VirtualSocket>) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SocketState::Listening {
            return Err(SocketError::NotListening);
        }
        inner.accept_queue.push_back(socket);
        drop(inner);
        self.data_available.notify_all();
        Ok(())
    }

    pub fn try_accept(&self) -> Option<Arc<VirtualSocket>> {
        self.inner.lock().unwrap().accept_queue.pop_front()
    }

    pub fn pending_accept_count(&self) -> usize {
        self.inner.lock().unwrap().accept_queue.len()
    }

    pub fn shutdown(&self, read: bool, write: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown_read |= read;
        inner.shutdown_write |= write;
    }

    pub fn is_read_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown_read
    }

    pub fn is_write_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown_write
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SocketState::Closed;
        inner.receive_queue.clear();
        inner.accept_queue.clear();
        drop(inner);
        self.data_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(node: u8, port: u16) -> VirtualAddr {
        VirtualAddr { ip: VirtualIpv4::for_node(node), port }
    }

    #[test]
    fn bind_then_connect_transitions_state() {
        let sock = VirtualSocket::new(SocketKind::Stream, Protocol::Tcp);
        assert_eq!(sock.state(), SocketState::Created);
        sock.bind(addr(0, 1000)).unwrap();
        assert_eq!(sock.state(), SocketState::Bound);
        sock.connect(addr(1, 2000)).unwrap();
        assert_eq!(sock.state(), SocketState::Connected);
        assert_eq!(sock.remote_addr(), Some(addr(1, 2000)));
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let sock = VirtualSocket::new(SocketKind::Dgram, Protocol::Udp);
        for i in 0..MAX_QUEUE_SIZE {
            sock.push_incoming(&[i as u8], addr(0, 1)).unwrap();
        }
        sock.push_incoming(&[0xFF], addr(0, 1)).unwrap();
        assert_eq!(sock.try_recv().unwrap().data, vec![1]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let sock = VirtualSocket::new(SocketKind::Dgram, Protocol::Udp);
        let huge = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(sock.push_incoming(&huge, addr(0, 1)), Err(SocketError::PayloadTooLarge));
    }

    #[test]
    fn non_blocking_recv_returns_none_when_empty() {
        let sock = VirtualSocket::new(SocketKind::Stream, Protocol::Tcp);
        sock.set_non_blocking(true);
        assert!(sock.recv_blocking(None).is_none());
    }

    #[test]
    fn listen_requires_bind_and_stream_kind() {
        let dgram = VirtualSocket::new(SocketKind::Dgram, Protocol::Udp);
        assert_eq!(dgram.listen(), Err(SocketError::WrongKind));

        let stream = VirtualSocket::new(SocketKind::Stream, Protocol::Tcp);
        assert_eq!(stream.listen(), Err(SocketError::NotBound));
        stream.bind(addr(0, 1000)).unwrap();
        stream.listen().unwrap();
        assert_eq!(stream.state(), SocketState::Listening);
    }

    #[test]
    fn accept_queue_is_fifo_and_requires_listening() {
        let listener = VirtualSocket::new(SocketKind::Stream, Protocol::Tcp);
        let incoming = Arc::new(VirtualSocket::new(SocketKind::Stream, Protocol::Tcp));
        assert_eq!(listener.push_accept(incoming.clone()), Err(SocketError::NotListening));

        listener.bind(addr(0, 1000)).unwrap();
        listener.listen().unwrap();
        listener.push_accept(incoming.clone()).unwrap();
        assert_eq!(listener.pending_accept_count(), 1);
        assert!(Arc::ptr_eq(&listener.try_accept().unwrap(), &incoming));
        assert!(listener.try_accept().is_none());
    }

    #[test]
    fn close_clears_queues_and_wakes_waiters() {
        let sock = VirtualSocket::new(SocketKind::Dgram, Protocol::Udp);
        sock.push_incoming(&[1], addr(0, 1)).unwrap();
        sock.close();
        assert_eq!(sock.state(), SocketState::Closed);
        assert!(!sock.has_pending_data());
    }

    #[test]
    fn blocking_recv_unblocks_with_none_when_closed_concurrently() {
        let sock = Arc::new(VirtualSocket::new(SocketKind::Dgram, Protocol::Udp));
        let closer = sock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        assert!(sock.recv_blocking(None).is_none());
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_read_makes_incoming_data_invisible() {
        let sock = VirtualSocket::new(SocketKind::Dgram, Protocol::Udp);
        sock.shutdown(true, false);
        sock.push_incoming(&[1, 2, 3], addr(0, 1)).unwrap();
        assert!(!sock.has_pending_data());
        assert!(sock.try_recv().is_none());
    }
}

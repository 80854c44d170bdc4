//! Error taxonomy (design §7): one closed `thiserror` enum per category,
//! matching [`ryu_protocol::FramingError`]'s category (a) sibling.
//!
//! `FramingError` lives in `ryu-protocol` since it is produced by decoding
//! alone; the remaining four categories are produced by this crate's
//! components and are collected here so callers match on a small, stable set
//! of enums instead of a generic boxed error.

use thiserror::Error;

/// Category (b): connection-lifecycle failures. These move the relay
/// client's state machine into `Backoff` and are visible to control-channel
/// observers, never directly to the game.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("TCP connect to the relay failed")]
    ConnectFailed,
    #[error("handshake did not complete within the configured timeout")]
    HandshakeTimeout,
    #[error("no pong was received within the ping response timeout")]
    PingTimeout,
    #[error("the peer reset the connection")]
    PeerReset,
}

/// Category (c): state-machine rejections. Returned verbatim to the caller,
/// never logged as failures (design §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("event is not valid for the current state")]
    InvalidTransition,
    #[error("the relay client is not in the Ready state")]
    NotReady,
    #[error("local-comm service is not in the expected state for this call")]
    WrongLocalCommState,
}

/// Category (d): exhaustion of a bounded resource.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("no ephemeral port is available for this protocol")]
    PortPoolExhausted,
    #[error("a bounded queue is full")]
    QueueOverflow,
    #[error("the maximum number of virtual sockets is already registered")]
    SocketLimitReached,
}

/// Category (e): caller misuse, surfaced verbatim (design §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CallerError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("file descriptor is not a recognized virtual socket")]
    InvalidFd,
    #[error("destination buffer is too short for the received payload")]
    ShortBuffer,
    #[error("operation would block")]
    WouldBlock,
}

//! Client-side runtime for tunneling a console's local-wireless multiplayer
//! stack over TCP: the relay-client protocol driver, the BSD socket
//! interceptor and its virtual-socket machinery, the P2P host/joiner pair,
//! and the local-comm service that ties them together behind the process's
//! shared runtime state.
//!
//! Module layout follows the dependency order bottom to top: wire-adjacent
//! leaves first (`reassembler`, `reconnect`, `state_machine`, `dispatcher`),
//! then the relay client built on top of them, then the virtual-network
//! bookkeeping (`node_mapper`, `proxy_buffer`, `port_pool`, `virtual_socket`,
//! `socket_registry`), then the BSD interceptor and the P2P subsystem that
//! both sit on top of it, and finally `local_comm_service` and
//! `shared_state` at the top, which wire everything else together.

pub mod bsd_interceptor;
pub mod config;
pub mod control_channel;
pub mod dispatcher;
pub mod errors;
pub mod local_comm_service;
pub mod node_mapper;
pub mod p2p_host;
pub mod p2p_joiner;
pub mod port_mapper;
pub mod port_pool;
pub mod proxy_buffer;
pub mod reassembler;
pub mod reconnect;
pub mod relay_client;
pub mod shared_state;
pub mod socket_registry;
pub mod state_machine;
pub mod virtual_socket;

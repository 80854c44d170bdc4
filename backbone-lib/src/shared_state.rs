//! Shared runtime state (design §3, §9), grounded on the original's
//! cross-component back references: a single process-wide record of what
//! game is currently tunneled, what the local-comm state machine is doing,
//! and the session snapshot the control channel reports on.
//!
//! The original exposes this through a `GetInstance()` singleton reached
//! from every layer. Here the data itself is an ordinary `SharedState`
//! struct; the singleton behavior is confined to the small `init`/`instance`/
//! `shutdown` facade at the bottom of this file, matching the "model global
//! singletons as explicit lifecycle-managed objects" guidance the rest of
//! this crate follows (e.g. [`crate::node_mapper::NodeMapper`] is handed
//! around as an `Arc` rather than reached for as a static).
//!
//! Lock order (design §5): shared-state < state-machine < node-mapper <
//! socket-registry. Nothing in this module ever calls back into another
//! component while holding `inner`'s lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// The local-comm session state machine (design §3): `None` through
/// `Finalize` from any state, `Error` reachable from any in-progress state
/// on a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalCommState {
    None,
    Initialized,
    AccessPoint,
    AccessPointCreated,
    Station,
    StationConnected,
    Error,
}

/// The 8-byte session descriptor the control channel reports on (design §6):
/// `{node_count, max_nodes, local_node_id, is_host, reserved[4]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub node_count: u8,
    pub max_node_count: u8,
    pub local_node_id: u8,
    pub is_host: bool,
}

struct Inner {
    game_active: bool,
    game_pid: Option<u32>,
    ldn_pid: Option<u32>,
    local_comm_state: LocalCommState,
    session_info: Option<SessionInfo>,
    last_rtt_ms: u64,
    reconnect_requested: bool,
    config: Config,
    config_path: Option<PathBuf>,
}

/// Process-wide resource acquired once at module start and released at
/// teardown (design §3). Read by the control channel and the BSD
/// interceptor; written by the local-comm service and by control-channel
/// mutators.
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                game_active: false,
                game_pid: None,
                ldn_pid: None,
                local_comm_state: LocalCommState::None,
                session_info: None,
                last_rtt_ms: 0,
                reconnect_requested: false,
                config,
                config_path: None,
            }),
        }
    }

    pub fn is_game_active(&self) -> bool {
        self.inner.lock().unwrap().game_active
    }

    pub fn game_pid(&self) -> Option<u32> {
        self.inner.lock().unwrap().game_pid
    }

    pub fn set_game_active(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.game_active = true;
        inner.game_pid = Some(pid);
    }

    pub fn clear_game_active(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.game_active = false;
        inner.game_pid = None;
    }

    /// Process id currently holding the local-comm session, set before the
    /// game-level `Initialize` call (design §9).
    pub fn ldn_pid(&self) -> Option<u32> {
        self.inner.lock().unwrap().ldn_pid
    }

    pub fn set_ldn_pid(&self, pid: Option<u32>) {
        self.inner.lock().unwrap().ldn_pid = pid;
    }

    pub fn is_process_tunneled(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().ldn_pid == Some(pid)
    }

    pub fn local_comm_state(&self) -> LocalCommState {
        self.inner.lock().unwrap().local_comm_state
    }

    pub fn set_local_comm_state(&self, state: LocalCommState) {
        self.inner.lock().unwrap().local_comm_state = state;
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.lock().unwrap().session_info
    }

    pub fn set_session_info(&self, info: Option<SessionInfo>) {
        self.inner.lock().unwrap().session_info = info;
    }

    pub fn last_rtt_ms(&self) -> u64 {
        self.inner.lock().unwrap().last_rtt_ms
    }

    pub fn set_last_rtt_ms(&self, rtt: u64) {
        self.inner.lock().unwrap().last_rtt_ms = rtt;
    }

    /// Set by the control channel; consumed once per tick by the relay
    /// client's owner thread (design §5 ordering guarantee).
    pub fn request_reconnect(&self) {
        self.inner.lock().unwrap().reconnect_requested = true;
    }

    /// Consumes and clears the reconnect request flag, returning whether it
    /// was set.
    pub fn take_reconnect_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.reconnect_requested)
    }

    pub fn config(&self) -> Config {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn replace_config(&self, config: Config) {
        self.inner.lock().unwrap().config = config;
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().config_path.clone()
    }

    pub fn set_config_path(&self, path: PathBuf) {
        self.inner.lock().unwrap().config_path = Some(path);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

static INSTANCE: Mutex<Option<Arc<SharedState>>> = Mutex::new(None);

/// Initializes the process-wide instance, returning the existing one if
/// already initialized. Mirrors the module entrypoint's "acquire once"
/// contract rather than a lazily-initialized static constructor.
pub fn init(config: Config) -> Arc<SharedState> {
    let mut guard = INSTANCE.lock().unwrap();
    guard.get_or_insert_with(|| Arc::new(SharedState::with_config(config))).clone()
}

/// Returns the process-wide instance, or `None` if [`init`] has not been
/// called.
pub fn instance() -> Option<Arc<SharedState>> {
    INSTANCE.lock().unwrap().clone()
}

/// Releases the process-wide instance. A later [`init`] call starts fresh.
pub fn shutdown() {
    *INSTANCE.lock().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_request_is_consumed_exactly_once() {
        let state = SharedState::new();
        assert!(!state.take_reconnect_request());
        state.request_reconnect();
        assert!(state.take_reconnect_request());
        assert!(!state.take_reconnect_request());
    }

    #[test]
    fn ldn_pid_gates_process_tunneled_check() {
        let state = SharedState::new();
        assert!(!state.is_process_tunneled(42));
        state.set_ldn_pid(Some(42));
        assert!(state.is_process_tunneled(42));
        assert!(!state.is_process_tunneled(7));
    }

    #[test]
    fn game_active_tracks_pid() {
        let state = SharedState::new();
        assert!(!state.is_game_active());
        state.set_game_active(99);
        assert!(state.is_game_active());
        assert_eq!(state.game_pid(), Some(99));
        state.clear_game_active();
        assert!(!state.is_game_active());
        assert_eq!(state.game_pid(), None);
    }

    #[test]
    fn init_returns_the_same_instance_until_shutdown() {
        shutdown();
        let a = init(Config::default());
        let b = init(Config::default());
        assert!(Arc::ptr_eq(&a, &b));
        shutdown();
        assert!(instance().is_none());
    }
}

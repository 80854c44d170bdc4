//! Connection state machine (design 4.4), grounded on
//! `connection_state.hpp`/`.cpp`'s `ConnectionStateMachine`: the enums, the
//! transition table and the retry-count bookkeeping are carried over
//! directly, including the two special idempotent no-op cases checked ahead
//! of the table.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    Backoff,
    Retrying,
    Disconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connect,
    ConnectSuccess,
    ConnectFailed,
    HandshakeStarted,
    HandshakeSuccess,
    HandshakeFailed,
    Disconnect,
    ConnectionLost,
    BackoffExpired,
    RetryRequested,
    FatalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    Success,
    InvalidTransition,
    AlreadyInState,
}

use ConnectionEvent as Ev;
use ConnectionState as St;

fn table_lookup(state: St, event: Ev) -> Option<St> {
    use ConnectionEvent::*;
    use ConnectionState::*;
    Some(match (state, event) {
        (Disconnected, Connect) => Connecting,
        (Disconnected, RetryRequested) => Connecting,

        (Connecting, ConnectSuccess) => Connected,
        (Connecting, ConnectFailed) => Backoff,
        (Connecting, Disconnect) => Disconnected,
        (Connecting, FatalError) => Error,

        (Connected, HandshakeStarted) => Handshaking,
        (Connected, HandshakeSuccess) => Ready,
        (Connected, HandshakeFailed) => Backoff,
        (Connected, ConnectionLost) => Backoff,
        (Connected, Disconnect) => Disconnecting,
        (Connected, FatalError) => Error,

        (Handshaking, HandshakeSuccess) => Ready,
        (Handshaking, HandshakeFailed) => Backoff,
        (Handshaking, ConnectionLost) => Backoff,
        (Handshaking, Disconnect) => Disconnecting,
        (Handshaking, FatalError) => Error,

        (Ready, ConnectionLost) => Backoff,
        (Ready, Disconnect) => Disconnecting,
        (Ready, FatalError) => Error,

        (Backoff, BackoffExpired) => Retrying,
        (Backoff, Disconnect) => Disconnected,
        (Backoff, RetryRequested) => Retrying,
        (Backoff, FatalError) => Error,

        (Retrying, ConnectSuccess) => Connected,
        (Retrying, ConnectFailed) => Backoff,
        (Retrying, Disconnect) => Disconnected,
        (Retrying, FatalError) => Error,

        (Disconnecting, ConnectSuccess) => Disconnected,
        (Disconnecting, ConnectFailed) => Disconnected,
        (Disconnecting, ConnectionLost) => Disconnected,
        (Disconnecting, FatalError) => Disconnected,

        (Error, Disconnect) => Disconnected,
        (Error, RetryRequested) => Connecting,

        _ => return None,
    })
}

/// Invoked synchronously at the moment of a successful transition, before
/// the triggering event returns. Must not call back into the state machine
/// (design §5, "components must not invoke another component's callback
/// while holding their own lock").
pub type StateChangeCallback = Box<dyn FnMut(ConnectionState, ConnectionState, ConnectionEvent) + Send>;

pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry_count: u32,
    callback: Option<StateChangeCallback>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self { state: ConnectionState::Disconnected, retry_count: 0, callback: None }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, St::Connected | St::Handshaking | St::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.state == St::Ready
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self.state, St::Connecting | St::Handshaking | St::Retrying | St::Disconnecting | St::Backoff)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    pub fn set_state_change_callback(&mut self, callback: StateChangeCallback) {
        self.callback = Some(callback);
    }

    /// Bypasses the transition table entirely; no callback is invoked.
    /// Reserved for test setup and recovery paths, matching `force_state`.
    pub fn force_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn process_event(&mut self, event: ConnectionEvent) -> TransitionResult {
        // Idempotent no-ops, checked before the table (connection_state.cpp).
        if self.state == St::Disconnected && event == Ev::Disconnect {
            return TransitionResult::AlreadyInState;
        }
        if self.state == St::Ready && event == Ev::ConnectSuccess {
            return TransitionResult::AlreadyInState;
        }

        let Some(new_state) = table_lookup(self.state, event) else {
            return TransitionResult::InvalidTransition;
        };

        let old_state = self.state;
        if new_state == St::Retrying
            || (new_state == St::Connecting && matches!(old_state, St::Backoff | St::Retrying))
        {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        if new_state == St::Ready {
            self.retry_count = 0;
        }

        self.state = new_state;
        if let Some(cb) = self.callback.as_mut() {
            cb(old_state, new_state, event);
        }
        TransitionResult::Success
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_ready_resets_retry_count() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.process_event(Ev::Connect), TransitionResult::Success);
        assert_eq!(sm.process_event(Ev::ConnectFailed), TransitionResult::Success);
        assert_eq!(sm.state(), St::Backoff);
        assert_eq!(sm.process_event(Ev::BackoffExpired), TransitionResult::Success);
        assert_eq!(sm.state(), St::Retrying);
        assert_eq!(sm.retry_count(), 1);
        assert_eq!(sm.process_event(Ev::ConnectSuccess), TransitionResult::Success);
        assert_eq!(sm.process_event(Ev::HandshakeStarted), TransitionResult::Success);
        assert_eq!(sm.process_event(Ev::HandshakeSuccess), TransitionResult::Success);
        assert_eq!(sm.state(), St::Ready);
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn invalid_event_leaves_state_and_retry_count_unchanged() {
        let mut sm = ConnectionStateMachine::new();
        sm.process_event(Ev::Connect);
        sm.process_event(Ev::ConnectFailed);
        sm.process_event(Ev::BackoffExpired);
        let (state_before, retry_before) = (sm.state(), sm.retry_count());
        assert_eq!(sm.process_event(Ev::HandshakeSuccess), TransitionResult::InvalidTransition);
        assert_eq!(sm.state(), state_before);
        assert_eq!(sm.retry_count(), retry_before);
    }

    #[test]
    fn disconnecting_always_lands_on_disconnected() {
        for event in [Ev::ConnectSuccess, Ev::ConnectFailed, Ev::ConnectionLost, Ev::FatalError] {
            let mut sm = ConnectionStateMachine::new();
            sm.force_state(St::Disconnecting);
            assert_eq!(sm.process_event(event), TransitionResult::Success);
            assert_eq!(sm.state(), St::Disconnected);
        }
    }

    #[test]
    fn idempotent_no_ops_report_already_in_state() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.process_event(Ev::Disconnect), TransitionResult::AlreadyInState);

        sm.force_state(St::Ready);
        assert_eq!(sm.process_event(Ev::ConnectSuccess), TransitionResult::AlreadyInState);
    }

    #[test]
    fn callback_observes_every_successful_transition() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let mut sm = ConnectionStateMachine::new();
        sm.set_state_change_callback(Box::new(move |old, new, ev| {
            seen_cb.lock().unwrap().push((old, new, ev));
        }));
        sm.process_event(Ev::Connect);
        sm.process_event(Ev::ConnectFailed);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(seen.lock().unwrap()[1], (St::Connecting, St::Backoff, Ev::ConnectFailed));
    }
}

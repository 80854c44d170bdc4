//! Control channel (design 4.16, expanded by the R component), grounded on
//! the teacher's `relay-server` admin surface (`lobby::reload_config`'s
//! read/reload pattern) but carried as a typed request/reply enum pair
//! rather than bespoke HTTP routes: a tiny loopback listener serializes the
//! same enum the caller builds directly, as JSON via `serde_json`.
//!
//! Every variant is dispatched through [`handle`], a plain function taking
//! the process-wide [`SharedState`] and a request — the same shape the
//! teacher uses for `reload_config(&AppState)`, generalized to the full
//! read/write surface this service needs (version, connection status,
//! local-comm state, session info, RTT and active process id as read-only
//! queries; server address, passphrase, feature toggles, debug level,
//! config persistence and forced reconnects as mutators).

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::shared_state::{LocalCommState, SessionInfo, SharedState};

/// Crate version reported by [`ControlRequest::GetVersion`], matching
/// whatever this workspace member's `Cargo.toml` declares.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    GetVersion,
    GetConnectionStatus,
    GetLocalCommState,
    GetSessionInfo,
    GetRtt,
    GetActiveProcessId,
    SetServerAddress { host: String, port: u16 },
    SetPassphrase(String),
    SetFeatureToggle { ldn_enabled: bool },
    SetDebugLevel(u8),
    SaveConfig,
    ReloadConfig,
    ForceReconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlReply {
    Version(String),
    /// Whether a game is currently tunneled (i.e. `ldn_pid` is set).
    ConnectionStatus { tunneled: bool },
    LocalCommState(LocalCommState),
    SessionInfo(Option<SessionInfo>),
    Rtt(u64),
    ActiveProcessId(Option<u32>),
    Ack,
    Error(String),
}

/// Dispatches one request against the shared state, mutating it as needed
/// and returning the reply to send back to the caller.
pub fn handle(state: &SharedState, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::GetVersion => ControlReply::Version(VERSION.to_string()),
        ControlRequest::GetConnectionStatus => {
            ControlReply::ConnectionStatus { tunneled: state.is_game_active() }
        }
        ControlRequest::GetLocalCommState => ControlReply::LocalCommState(state.local_comm_state()),
        ControlRequest::GetSessionInfo => ControlReply::SessionInfo(state.session_info()),
        ControlRequest::GetRtt => ControlReply::Rtt(state.last_rtt_ms()),
        ControlRequest::GetActiveProcessId => ControlReply::ActiveProcessId(state.game_pid()),

        ControlRequest::SetServerAddress { host, port } => {
            let mut config = state.config();
            config.server.host = host;
            config.server.port = port;
            state.replace_config(config);
            ControlReply::Ack
        }
        ControlRequest::SetPassphrase(passphrase) => {
            let mut config = state.config();
            config.ldn.passphrase = passphrase;
            state.replace_config(config);
            ControlReply::Ack
        }
        ControlRequest::SetFeatureToggle { ldn_enabled } => {
            let mut config = state.config();
            config.ldn.enabled = ldn_enabled;
            state.replace_config(config);
            ControlReply::Ack
        }
        ControlRequest::SetDebugLevel(level) => {
            let mut config = state.config();
            config.debug.level = level.min(crate::config::DebugSection::MAX_LEVEL);
            state.replace_config(config);
            ControlReply::Ack
        }
        ControlRequest::SaveConfig => match state.config_path() {
            Some(path) => match state.config().save_to_file(&path) {
                Ok(()) => ControlReply::Ack,
                Err(e) => ControlReply::Error(e.to_string()),
            },
            None => ControlReply::Error(String::from("no config path is set for this session")),
        },
        ControlRequest::ReloadConfig => match state.config_path() {
            Some(path) => match crate::config::Config::load_from_file(&path) {
                Ok(config) => {
                    state.replace_config(config);
                    ControlReply::Ack
                }
                Err(e) => ControlReply::Error(e.to_string()),
            },
            None => ControlReply::Error(String::from("no config path is set for this session")),
        },
        ControlRequest::ForceReconnect => {
            state.request_reconnect();
            ControlReply::Ack
        }
    }
}

/// Address the loopback control listener binds by default.
pub const DEFAULT_ADDR: &str = "127.0.0.1:30457";

/// Runs a blocking loopback TCP listener that reads one newline-delimited
/// JSON [`ControlRequest`] per connection and writes back the JSON
/// [`ControlReply`], closing the connection afterward. Intended to be spawned
/// on its own thread by the module entrypoint; never touches the relay
/// client or any other component directly, only [`SharedState`].
pub fn serve(addr: &str, state: Arc<SharedState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(_) => continue,
        };
        let state = state.clone();
        std::thread::spawn(move || {
            let _ = serve_one(stream, &state);
        });
    }
    Ok(())
}

fn serve_one(mut stream: TcpStream, state: &SharedState) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }
    let reply = match serde_json::from_str::<ControlRequest>(line.trim_end()) {
        Ok(request) => handle(state, request),
        Err(e) => ControlReply::Error(e.to_string()),
    };
    let mut out = serde_json::to_string(&reply).unwrap_or_else(|_| String::from("\"serialization failed\""));
    out.push('\n');
    stream.write_all(out.as_bytes())
}

/// Config path helper used by the module entrypoint to point the shared
/// state at a config file before serving control requests.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("ryu-ldn.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::SessionInfo;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    #[test]
    fn get_version_reports_crate_version() {
        let state = SharedState::new();
        assert_eq!(handle(&state, ControlRequest::GetVersion), ControlReply::Version(VERSION.to_string()));
    }

    #[test]
    fn set_server_address_updates_config() {
        let state = SharedState::new();
        let reply = handle(
            &state,
            ControlRequest::SetServerAddress { host: String::from("example.com"), port: 1234 },
        );
        assert_eq!(reply, ControlReply::Ack);
        assert_eq!(state.config().server.host, "example.com");
        assert_eq!(state.config().server.port, 1234);
    }

    #[test]
    fn force_reconnect_sets_the_shared_flag() {
        let state = SharedState::new();
        assert_eq!(handle(&state, ControlRequest::ForceReconnect), ControlReply::Ack);
        assert!(state.take_reconnect_request());
    }

    #[test]
    fn get_session_info_reflects_local_comm_service_writes() {
        let state = SharedState::new();
        assert_eq!(handle(&state, ControlRequest::GetSessionInfo), ControlReply::SessionInfo(None));
        let info = SessionInfo { node_count: 2, max_node_count: 8, local_node_id: 0, is_host: true };
        state.set_session_info(Some(info));
        assert_eq!(handle(&state, ControlRequest::GetSessionInfo), ControlReply::SessionInfo(Some(info)));
    }

    #[test]
    fn serve_one_round_trips_a_request_over_tcp() {
        let state = Arc::new(SharedState::new());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state_for_server = state.clone();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_one(stream, &state_for_server).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        writeln!(client, "{}", serde_json::to_string(&ControlRequest::GetVersion).unwrap()).unwrap();
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let reply: ControlReply = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(reply, ControlReply::Version(VERSION.to_string()));
    }
}

use crate::api::{ServerConfig, ServerProps, ServiceError};
use crate::client::machine::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Low-level signals raised by a socket, tagged by the driver with the
/// generation of the socket that raised them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSignal {
    /// Socket established
    Connect,
    /// An established socket dropped
    Disconnect,
    /// A connect attempt failed; the socket keeps retrying
    ConnectError(String),
    /// A connect attempt timed out; counted like `ConnectError`
    ConnectTimeout,
}

/// Terminal fault recorded on a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFault {
    /// Too many consecutive connect errors; the server was deactivated
    Timeout,
}

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFault::Timeout => f.write_str("timeout error"),
        }
    }
}

/// Failure of a single remote call.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Called before a transport exists. Check status before making calls.
    #[error("no client for '{0}'; check connection status before making calls")]
    NoClient(String),
    #[error(transparent)]
    Remote(#[from] ServiceError),
    #[error("transport closed before '{0}' answered")]
    Closed(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl CallError {
    /// Structured `{name, message, code}` form for display.
    pub fn to_service_error(&self) -> ServiceError {
        match self {
            CallError::Remote(err) => err.clone(),
            CallError::NoClient(_) => ServiceError::new("NoClient", self.to_string(), 0),
            CallError::Closed(_) => ServiceError::new("Disconnected", self.to_string(), 0),
            CallError::Decode(_) => ServiceError::new("BadResponse", self.to_string(), 0),
        }
    }
}

/// Point-in-time view of a server connection, readable without touching the
/// driver task.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub phase: Phase,
    pub url: String,
    pub is_active: bool,
    pub is_initialized: bool,
    pub is_connected: bool,
    pub is_authenticated: bool,
    pub is_ready: bool,
    pub is_restarting: bool,
    pub error_count: u32,
    pub fault: Option<ServerFault>,
    pub has_client: bool,
    /// Bumped for every socket opened; a ready flag only holds for the
    /// socket it was reached on
    pub socket_generation: u64,
}

/// Events emitted upward by a server connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    PhaseChanged {
        server_id: String,
        phase: Phase,
    },
    InitializedChanged {
        server_id: String,
        value: bool,
    },
    ConnectedChanged {
        server_id: String,
        value: bool,
    },
    AuthenticatedChanged {
        server_id: String,
        value: bool,
    },
    /// initialized && connected && authenticated
    ReadyChanged {
        server_id: String,
        value: bool,
    },
    ErrorChanged {
        server_id: String,
        error_count: u32,
        fault: Option<ServerFault>,
    },
    /// Debounced request to persist the current config
    ConfigChanged { config: ServerConfig },
}

impl ServerEvent {
    pub fn server_id(&self) -> &str {
        match self {
            ServerEvent::PhaseChanged { server_id, .. }
            | ServerEvent::InitializedChanged { server_id, .. }
            | ServerEvent::ConnectedChanged { server_id, .. }
            | ServerEvent::AuthenticatedChanged { server_id, .. }
            | ServerEvent::ReadyChanged { server_id, .. }
            | ServerEvent::ErrorChanged { server_id, .. } => server_id,
            ServerEvent::ConfigChanged { config } => &config.id,
        }
    }
}

/// Commands sent from the owning thread to a server's driver task.
#[derive(Debug)]
pub(crate) enum ServerCommand {
    Connect,
    Disconnect,
    Restart,
    ClearError,
    ToggleActive,
    Update(ServerProps),
    Shutdown,
}

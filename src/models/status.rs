use serde::{Deserialize, Serialize};

/// Status of one supervised Tor process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    NotStarted,
    Starting,
    Connected,
    /// Transient; always returns to `Connected`
    ExecutingControlCommand,
    Stopped,
    FailedToConnect,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::NotStarted => "not_started",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Connected => "connected",
            ProcessStatus::ExecutingControlCommand => "executing_control_command",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::FailedToConnect => "failed_to_connect",
        }
    }

    /// The process has been spawned and has not exited or failed yet
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting
                | ProcessStatus::Connected
                | ProcessStatus::ExecutingControlCommand
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a proxied HTTP client, also used as the aggregate pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[default]
    Uninitialized,
    ConnectingToProxy,
    FailedToConnect,
    ConnectedToProxy,
    ClientReady,
    RequestingCleanCircuits,
    Disconnected,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Uninitialized => "uninitialized",
            ClientStatus::ConnectingToProxy => "connecting_to_proxy",
            ClientStatus::FailedToConnect => "failed_to_connect",
            ClientStatus::ConnectedToProxy => "connected_to_proxy",
            ClientStatus::ClientReady => "client_ready",
            ClientStatus::RequestingCleanCircuits => "requesting_clean_circuits",
            ClientStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ClientStatus::ClientReady)
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

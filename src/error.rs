use thiserror::Error;

use crate::models::{ClientStatus, ProcessStatus};

/// Unified error type for torpool
#[derive(Error, Debug)]
pub enum TorPoolError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Misuse errors
    #[error("Client is not ready (status: {status})")]
    NotReady { status: ClientStatus },

    #[error("{0} is already initialized")]
    AlreadyInitialized(String),

    #[error("Supervisor was already started and cannot be restarted")]
    AlreadyStarted,

    #[error("Operation not valid while process is {status}")]
    InvalidState { status: ProcessStatus },

    // Control protocol errors
    #[error("Control command failed: {0}")]
    ControlCommand(String),

    #[error("Control connection failed: {0}")]
    ControlConnection(String),

    // Network probe errors
    #[error("Network probe failed: {0}")]
    Probe(String),

    // Pool wait errors
    #[error("Timed out after {waited_ms}ms waiting for a ready client")]
    Timeout { waited_ms: u64 },

    #[error("Operation canceled")]
    Canceled,

    #[error("No ports left in range {0}")]
    PortsExhausted(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for torpool operations
pub type Result<T> = std::result::Result<T, TorPoolError>;

impl TorPoolError {
    /// Programming errors: calling an operation in a state that never allows it.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TorPoolError::NotReady { .. }
                | TorPoolError::AlreadyInitialized(_)
                | TorPoolError::AlreadyStarted
                | TorPoolError::InvalidState { .. }
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, TorPoolError::InvalidConfig(_))
    }

    /// Errors caused by the network or the proxy process rather than the caller
    pub fn is_runtime_failure(&self) -> bool {
        matches!(
            self,
            TorPoolError::ControlCommand(_)
                | TorPoolError::ControlConnection(_)
                | TorPoolError::Probe(_)
                | TorPoolError::Timeout { .. }
                | TorPoolError::Io(_)
                | TorPoolError::Http(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for TorPoolError {
    fn from(err: url::ParseError) -> Self {
        TorPoolError::InvalidConfig(format!("invalid URL: {}", err))
    }
}

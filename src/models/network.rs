use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body returned by the status-check endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheckResponse {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "IsTor")]
    pub is_tor: bool,
}

/// Outcome of fetching the status-check endpoint through a SOCKS port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProbeResult {
    pub success: bool,
    pub ip: Option<String>,
    pub is_tor: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl NetworkProbeResult {
    pub fn from_response(response: StatusCheckResponse) -> Self {
        let error = if response.is_tor {
            None
        } else {
            Some(format!("exit address {} is not a Tor exit", response.ip))
        };

        Self {
            success: response.is_tor,
            ip: Some(response.ip),
            is_tor: response.is_tor,
            error,
            checked_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            ip: None,
            is_tor: false,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

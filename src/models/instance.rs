use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_SOCKS_PORT: u16 = 9050;
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Ports and data directory of one Tor process
///
/// Fixed for the lifetime of the supervisor that is started with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceConfig {
    pub control_port: u16,
    pub socks_port: u16,
    pub data_directory: Option<PathBuf>,
}

impl Default for ProcessInstanceConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            socks_port: DEFAULT_SOCKS_PORT,
            data_directory: None,
        }
    }
}

impl ProcessInstanceConfig {
    pub fn new(control_port: u16, socks_port: u16) -> Self {
        Self {
            control_port,
            socks_port,
            data_directory: None,
        }
    }

    pub fn with_data_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_directory = Some(dir.into());
        self
    }

    /// Use `<root>/<token>` as the data directory
    pub fn with_generated_data_directory(self, root: &Path, token: &str) -> Self {
        self.with_data_directory(root.join(token))
    }

    /// Proxy URL for clients routed through this instance
    ///
    /// `socks5h` so hostnames are resolved by Tor, not locally.
    pub fn socks_proxy_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.socks_port)
    }

    pub fn control_addr(&self) -> String {
        format!("127.0.0.1:{}", self.control_port)
    }
}

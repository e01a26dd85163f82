use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Result, TorPoolError};
use crate::models::{HttpSettings, PoolSettings};

pub const DEFAULT_ARGUMENTS: &str =
    "--SocksPort {socksPort} --ControlPort {controlPort} --CookieAuthentication 0";
pub const DEFAULT_STATUS_URL: &str = "https://check.torproject.org/api/ip";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Tor process configuration
    pub service: ServiceConfig,
    /// Default pool settings
    pub pool: PoolSettings,
    /// Default client transport settings
    pub http: HttpSettings,
    /// Logging configuration
    pub log: LogConfig,
}

/// How Tor processes are launched and talked to
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the Tor executable
    pub executable: PathBuf,
    /// Argument template with {cwd}, {socksPort} and {controlPort} placeholders
    pub arguments: String,
    /// Working directory, substituted for {cwd}
    pub working_dir: PathBuf,
    /// Password sent with AUTHENTICATE on the control port
    pub control_password: String,
    /// Endpoint returning {"IP": ..., "IsTor": ...}
    pub status_url: String,
    /// Parent directory for generated data directories
    pub data_root: PathBuf,
    /// Seconds to wait for "Bootstrapped 100%"
    pub startup_timeout: u64,
    /// Seconds allowed for one control exchange
    pub control_timeout: u64,
    /// Seconds allowed for one network probe
    pub probe_timeout: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping
    pub stop_grace: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(default_executable()),
            arguments: DEFAULT_ARGUMENTS.to_string(),
            working_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            control_password: String::new(),
            status_url: DEFAULT_STATUS_URL.to_string(),
            data_root: env::temp_dir().join("torpool"),
            startup_timeout: 120,
            control_timeout: 10,
            probe_timeout: 30,
            stop_grace: 5,
        }
    }
}

impl ServiceConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace)
    }

    /// Check the settings that would otherwise only fail once a process starts
    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(TorPoolError::InvalidConfig(
                "TORPOOL_TOR_PATH must not be empty".into(),
            ));
        }
        if self.arguments.trim().is_empty() {
            return Err(TorPoolError::InvalidConfig(
                "TORPOOL_TOR_ARGUMENTS must not be empty".into(),
            ));
        }
        Url::parse(&self.status_url).map_err(|e| {
            TorPoolError::InvalidConfig(format!("TORPOOL_STATUS_URL must be a valid URL: {}", e))
        })?;
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = ServiceConfig::default();
        let service = ServiceConfig {
            executable: PathBuf::from(get_env_or(
                "TORPOOL_TOR_PATH",
                &defaults.executable.to_string_lossy(),
            )),
            arguments: get_env_or("TORPOOL_TOR_ARGUMENTS", DEFAULT_ARGUMENTS),
            working_dir: env::var("TORPOOL_TOR_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.working_dir),
            control_password: get_env_or("TORPOOL_CONTROL_PASSWORD", ""),
            status_url: get_env_or("TORPOOL_STATUS_URL", DEFAULT_STATUS_URL),
            data_root: env::var("TORPOOL_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            startup_timeout: parse_env("TORPOOL_STARTUP_TIMEOUT", "120")?,
            control_timeout: parse_env("TORPOOL_CONTROL_TIMEOUT", "10")?,
            probe_timeout: parse_env("TORPOOL_PROBE_TIMEOUT", "30")?,
            stop_grace: parse_env("TORPOOL_STOP_GRACE", "5")?,
        };
        service.validate()?;

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            size: parse_env("TORPOOL_POOL_SIZE", "1")?,
            balancing: get_env_or("TORPOOL_BALANCING", "round_robin"),
            randomize_ports: get_env_or("TORPOOL_RANDOMIZE_PORTS", "true")
                .parse()
                .unwrap_or(true),
            starting_control_port: parse_env("TORPOOL_START_CONTROL_PORT", "9000")?,
            starting_socks_port: parse_env("TORPOOL_START_SOCKS_PORT", "9500")?,
            poll_delay_ms: parse_env("TORPOOL_POLL_DELAY_MS", "100")?,
            wait_timeout_ms: parse_env("TORPOOL_WAIT_TIMEOUT_MS", "30000")?,
            ..pool_defaults
        };

        let http = HttpSettings {
            user_agent: env::var("TORPOOL_USER_AGENT").ok().filter(|s| !s.is_empty()),
            timeout_secs: parse_env("TORPOOL_REQUEST_TIMEOUT", "60")?,
            use_cookies: get_env_or("TORPOOL_USE_COOKIES", "false")
                .parse()
                .unwrap_or(false),
            renew_circuits_after_secs: parse_optional_env("TORPOOL_RENEW_AFTER_SECS")?,
            renew_circuits_after_requests: parse_optional_env("TORPOOL_RENEW_AFTER_REQUESTS")?,
            ..HttpSettings::default()
        };

        Ok(Config {
            service,
            pool,
            http,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

fn default_executable() -> &'static str {
    if cfg!(windows) {
        "tor.exe"
    } else {
        "tor"
    }
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| TorPoolError::InvalidConfig(format!("{} must be a valid number", key)))
}

fn parse_optional_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TorPoolError::InvalidConfig(format!("{} must be a valid number", key))),
        _ => Ok(None),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

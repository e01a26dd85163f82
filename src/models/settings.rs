use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport settings for one proxied HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Follow HTTP redirects
    pub follow_redirects: bool,
    /// Redirect hop limit when following
    pub max_redirects: usize,
    /// Accept gzip/brotli encoded responses and decode them
    pub decompress: bool,
    /// Minimum TLS version ("1.0", "1.1", "1.2", "1.3"); None = library default
    pub min_tls_version: Option<String>,
    /// Keep a per-client cookie jar
    pub use_cookies: bool,
    /// Headers added to every request
    pub default_headers: BTreeMap<String, String>,
    /// Base address used to derive Host/Origin/Referer
    pub base_address: Option<String>,
    /// Send Host/Origin/Referer derived from `base_address`
    pub set_origin_headers: bool,
    pub accept: String,
    /// None lets the pool pick one from its user agent list
    pub user_agent: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Renew circuits once this many seconds passed since the last renewal
    pub renew_circuits_after_secs: Option<u64>,
    /// Renew circuits every N requests
    pub renew_circuits_after_requests: Option<u64>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: 10,
            decompress: true,
            min_tls_version: Some("1.2".to_string()),
            use_cookies: false,
            default_headers: BTreeMap::new(),
            base_address: None,
            set_origin_headers: true,
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
                .to_string(),
            user_agent: None,
            timeout_secs: 60,
            renew_circuits_after_secs: None,
            renew_circuits_after_requests: None,
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Settings for a pool of proxied clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of Tor processes / clients
    pub size: usize,
    /// Balancing method: round_robin, random
    pub balancing: String,
    /// Allocate random unique ports instead of sequential ones
    pub randomize_ports: bool,
    /// First control port when ports are sequential
    pub starting_control_port: u16,
    /// First SOCKS port when ports are sequential
    pub starting_socks_port: u16,
    /// User agents to pick from when the HTTP settings set none
    pub user_agents: Vec<String>,
    /// Delay between balancing attempts while no client is ready, in ms
    pub poll_delay_ms: u64,
    /// Give up waiting for a ready client after this many ms
    pub wait_timeout_ms: u64,
    /// Client ids are `<prefix>-<index>`
    pub id_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 1,
            balancing: "round_robin".to_string(),
            randomize_ports: true,
            starting_control_port: 9000,
            starting_socks_port: 9500,
            user_agents: default_user_agents(),
            poll_delay_ms: 100,
            wait_timeout_ms: 30_000,
            id_prefix: "tor".to_string(),
        }
    }
}

impl PoolSettings {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn client_id(&self, index: usize) -> String {
        format!("{}-{}", self.id_prefix, index)
    }
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0",
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.5; rv:128.0) Gecko/20100101 Firefox/128.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

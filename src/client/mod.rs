//! Proxied HTTP client
//!
//! A [`TorHttpClient`] owns one Tor process and a transport routed through its
//! SOCKS port, and renews circuits automatically according to its settings.

mod http_client;
pub mod renewal;
pub mod transport;

pub use http_client::TorHttpClient;
pub use renewal::RenewalPolicy;
pub use transport::build_transport;

//! torpool - HTTP through a pool of supervised Tor processes
//!
//! ## Layers
//!
//! - `service`: launches one Tor process, detects bootstrap from its log
//!   output, talks to its control port and probes its SOCKS port
//! - `client`: an HTTP client routed through one Tor process, with automatic
//!   circuit renewal by elapsed time or request count
//! - `pool`: many clients behind one, balanced round-robin or randomly, with a
//!   bounded wait for a ready member
//! - `factory`: builds clients and pools and keeps named pools for reuse

pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod models;
pub mod pool;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use client::TorHttpClient;
pub use config::Config;
pub use error::{Result, TorPoolError};
pub use factory::TorPoolFactory;
pub use pool::TorPool;

//! Port and data-directory token allocation
//!
//! Supervisors that run at the same time must never share ports or data
//! directories. Allocation goes through a [`PortAllocator`] handed to the
//! factory so tests and deployments can pick their own sequences.

use std::collections::{HashSet, VecDeque};
use std::net::TcpListener;
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TorPoolError};

pub const CONTROL_PORT_RANGE: RangeInclusive<u16> = 9000..=9499;
pub const SOCKS_PORT_RANGE: RangeInclusive<u16> = 9500..=9999;

const RANDOM_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub control: u16,
    pub socks: u16,
}

pub trait PortAllocator: Send + Sync {
    /// Reserve a control/SOCKS port pair
    fn allocate(&self) -> Result<PortPair>;

    /// Give a pair back once its process has stopped
    fn release(&self, ports: PortPair);

    /// Unique token naming a generated data directory
    fn token(&self) -> String;
}

/// Random ports from disjoint ranges, never handing out a port twice while reserved
pub struct RandomPortAllocator {
    control_range: RangeInclusive<u16>,
    socks_range: RangeInclusive<u16>,
    used: Mutex<HashSet<u16>>,
    tokens: Mutex<HashSet<String>>,
    check_bindable: bool,
}

impl RandomPortAllocator {
    pub fn new() -> Self {
        Self::with_ranges(CONTROL_PORT_RANGE, SOCKS_PORT_RANGE)
    }

    pub fn with_ranges(control_range: RangeInclusive<u16>, socks_range: RangeInclusive<u16>) -> Self {
        Self {
            control_range,
            socks_range,
            used: Mutex::new(HashSet::new()),
            tokens: Mutex::new(HashSet::new()),
            check_bindable: true,
        }
    }

    /// Skip the local bind probe (ports are only deduplicated)
    pub fn without_bind_check(mut self) -> Self {
        self.check_bindable = false;
        self
    }

    pub fn reserved_count(&self) -> usize {
        self.used.lock().len()
    }

    fn pick(&self, used: &mut HashSet<u16>, range: &RangeInclusive<u16>) -> Result<u16> {
        let mut rng = rand::thread_rng();

        for _ in 0..RANDOM_ATTEMPTS {
            let port = rng.gen_range(range.clone());
            if !used.contains(&port) && self.is_bindable(port) {
                used.insert(port);
                return Ok(port);
            }
        }

        // Dense range: fall back to a scan.
        for port in range.clone() {
            if !used.contains(&port) && self.is_bindable(port) {
                used.insert(port);
                return Ok(port);
            }
        }

        Err(TorPoolError::PortsExhausted(format!(
            "{}-{}",
            range.start(),
            range.end()
        )))
    }

    fn is_bindable(&self, port: u16) -> bool {
        if !self.check_bindable {
            return true;
        }
        let bindable = TcpListener::bind(("127.0.0.1", port)).is_ok();
        if !bindable {
            debug!("Port {} is taken, skipping", port);
        }
        bindable
    }
}

impl Default for RandomPortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator for RandomPortAllocator {
    fn allocate(&self) -> Result<PortPair> {
        let mut used = self.used.lock();
        let control = self.pick(&mut used, &self.control_range)?;
        let socks = match self.pick(&mut used, &self.socks_range) {
            Ok(port) => port,
            Err(e) => {
                used.remove(&control);
                return Err(e);
            }
        };
        Ok(PortPair { control, socks })
    }

    fn release(&self, ports: PortPair) {
        let mut used = self.used.lock();
        used.remove(&ports.control);
        used.remove(&ports.socks);
    }

    fn token(&self) -> String {
        let mut tokens = self.tokens.lock();
        loop {
            let token = Uuid::new_v4().simple().to_string();
            if tokens.insert(token.clone()) {
                return token;
            }
        }
    }
}

/// Hands out a fixed list of port pairs in order
pub struct SequencePortAllocator {
    pairs: Mutex<VecDeque<PortPair>>,
    counter: Mutex<u64>,
}

impl SequencePortAllocator {
    pub fn new(pairs: impl IntoIterator<Item = PortPair>) -> Self {
        Self {
            pairs: Mutex::new(pairs.into_iter().collect()),
            counter: Mutex::new(0),
        }
    }
}

impl PortAllocator for SequencePortAllocator {
    fn allocate(&self) -> Result<PortPair> {
        self.pairs
            .lock()
            .pop_front()
            .ok_or_else(|| TorPoolError::PortsExhausted("configured sequence".into()))
    }

    fn release(&self, ports: PortPair) {
        self.pairs.lock().push_back(ports);
    }

    fn token(&self) -> String {
        let mut counter = self.counter.lock();
        *counter += 1;
        format!("instance-{}-{}", std::process::id(), *counter)
    }
}

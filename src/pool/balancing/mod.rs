//! Client balancing strategies
//!
//! A selector only picks an index; whether that client is ready is the pool's concern.

mod random;
mod round_robin;

pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

/// Strategy types for spreading requests over pool members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    Random,
}

impl BalancingStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "random" => Self::Random,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
        }
    }
}

/// Trait for client selection strategies
pub trait ClientSelector: Send + Sync {
    /// Index in `0..len`; `len` is never zero
    fn select(&self, len: usize) -> usize;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create a client selector based on the strategy type
pub fn create_selector(strategy: BalancingStrategy) -> Box<dyn ClientSelector> {
    match strategy {
        BalancingStrategy::RoundRobin => Box::new(RoundRobinSelector::new()),
        BalancingStrategy::Random => Box::new(RandomSelector::new()),
    }
}

//! Random client selection

use rand::Rng;

use super::ClientSelector;

/// Picks a uniformly random client
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl ClientSelector for RandomSelector {
    fn select(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len.max(1))
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}

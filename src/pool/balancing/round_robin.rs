//! Round-robin client selection

use std::sync::atomic::{AtomicUsize, Ordering};

use super::ClientSelector;

/// Uses an atomic counter for lock-free index tracking.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSelector for RoundRobinSelector {
    fn select(&self, len: usize) -> usize {
        self.index.fetch_add(1, Ordering::Relaxed) % len.max(1)
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_round_robin_order() {
        let selector = RoundRobinSelector::new();
        let picked: Vec<usize> = (0..6).map(|_| selector.select(3)).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_even_distribution_across_threads() {
        let selector = Arc::new(RoundRobinSelector::new());
        let mut counts = [0usize; 3];

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let selector = selector.clone();
                std::thread::spawn(move || (0..25).map(|_| selector.select(3)).collect::<Vec<_>>())
            })
            .collect();

        for handle in handles {
            for index in handle.join().unwrap() {
                counts[index] += 1;
            }
        }

        // 100 picks over 3 clients: each gets floor or ceil of 100/3.
        for count in counts {
            assert!(count == 33 || count == 34, "{:?}", counts);
        }
    }
}

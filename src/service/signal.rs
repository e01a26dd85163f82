//! Resettable completion gate
//!
//! Many tasks can wait on the gate; one owner sets and resets it. Resetting
//! swaps in a fresh gate only while the current one is released, so a waiter
//! that already observed the release is never un-released.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Outcome of waiting on an [`AsyncSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalWait {
    Released,
    TimedOut,
    Canceled,
}

struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    fn is_released(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct AsyncSignal {
    gate: ArcSwap<Gate>,
    closed: CancellationToken,
}

impl AsyncSignal {
    pub fn new() -> Self {
        Self {
            gate: ArcSwap::from_pointee(Gate::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Release all current and future waiters until the next reset
    pub fn set(&self) {
        self.gate.load().tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        self.gate.load().is_released()
    }

    /// Re-arm the gate. No-op while it is not released.
    pub fn reset(&self) {
        loop {
            let current = self.gate.load_full();
            if !current.is_released() {
                return;
            }

            let previous = self.gate.compare_and_swap(&current, Arc::new(Gate::new()));
            if Arc::ptr_eq(&*previous, &current) {
                return;
            }
            // Someone else swapped the gate first; look at the new one.
        }
    }

    /// Wait for release, an optional timeout, or cancellation
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> SignalWait {
        let mut rx = self.gate.load().tx.subscribe();

        let released = async move {
            let ok = rx.wait_for(|released| *released).await.is_ok();
            ok
        };
        let timed_out = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => pending::<()>().await,
            }
        };
        let canceled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            ok = released => {
                if ok {
                    SignalWait::Released
                } else {
                    SignalWait::Canceled
                }
            }
            _ = self.closed.cancelled() => SignalWait::Canceled,
            _ = canceled => SignalWait::Canceled,
            _ = timed_out => SignalWait::TimedOut,
        }
    }

    /// Cancel every pending and future waiter
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for AsyncSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncSignal {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

//! A minimal cooperative cancellation signal.
//!
//! Every blocking call in the core (queue pop, governor acquire, HTTP
//! read/write) accepts a [`CancellationToken`] and exits at its next
//! suspension point once the token fires (§5). Built on `tokio::sync::watch`
//! rather than pulling in `tokio-util` for a single primitive.

use tokio::sync::watch;

/// Cooperative cancellation signal, cheap to clone and share.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: watch::Sender<bool>,
}

/// A clonable handle that observes cancellation fired on its parent token.
#[derive(Debug, Clone)]
pub struct CancellationWatcher {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Creates a fresh, not-yet-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fires cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns whether cancellation has already fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a watcher that can be awaited or polled independently.
    #[must_use]
    pub fn watcher(&self) -> CancellationWatcher {
        CancellationWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationWatcher {
    /// Returns whether cancellation has already fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation fires. Resolves immediately if it already
    /// has.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        // A closed sender (token dropped) is treated as "never cancels";
        // callers race this against real work, so it simply never wins.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

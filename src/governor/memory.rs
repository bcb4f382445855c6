//! In-flight buffer memory governor (§4.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::cancel::CancellationWatcher;

struct Inner {
    cap: u64,
    used: AtomicU64,
    released: Notify,
}

/// Caps aggregate in-flight buffer memory across all active workers.
///
/// Workers call [`MemoryGovernor::acquire`] before reading a chunk into
/// memory and hold the returned [`BufferHandle`] until the chunk is
/// flushed; dropping the handle releases its share of the cap.
#[derive(Clone)]
pub struct MemoryGovernor {
    inner: Arc<Inner>,
}

impl MemoryGovernor {
    /// Creates a governor with total capacity `cap_bytes`.
    #[must_use]
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                cap: cap_bytes,
                used: AtomicU64::new(0),
                released: Notify::new(),
            }),
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.inner.cap
    }

    /// Currently outstanding bytes across all live handles.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Whether outstanding usage has crossed the 80% soft-pressure mark
    /// (§4.5), a hint for workers to prefer smaller chunks or flush sooner.
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.used() as f64 >= self.inner.cap as f64 * 0.8
    }

    /// Blocks cooperatively until `n_bytes` of headroom is available, or
    /// `watcher` fires cancellation first.
    #[instrument(skip(self, watcher), fields(n_bytes))]
    pub async fn acquire(&self, n_bytes: u64, watcher: &mut CancellationWatcher) -> Option<BufferHandle> {
        loop {
            if watcher.is_cancelled() {
                return None;
            }

            let current = self.inner.used.load(Ordering::Acquire);
            if current.saturating_add(n_bytes) <= self.inner.cap {
                if self
                    .inner
                    .used
                    .compare_exchange(current, current + n_bytes, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if self.under_pressure() {
                        debug!(used = current + n_bytes, cap = self.inner.cap, "memory governor under pressure");
                    }
                    return Some(BufferHandle {
                        inner: self.inner.clone(),
                        bytes: n_bytes,
                    });
                }
                // Lost the race to another acquirer; retry.
                continue;
            }

            tokio::select! {
                () = watcher.cancelled() => return None,
                () = self.inner.released.notified() => {},
            }
        }
    }
}

/// An admitted share of the memory cap. Releases automatically on drop.
pub struct BufferHandle {
    inner: Arc<Inner>,
    bytes: u64,
}

impl BufferHandle {
    /// Bytes admitted by this handle.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.inner.used.fetch_sub(self.bytes, Ordering::AcqRel);
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_round_trips_capacity() {
        let gov = MemoryGovernor::new(1024);
        let token = CancellationToken::new();
        let mut watcher = token.watcher();

        let handle = gov.acquire(512, &mut watcher).await.unwrap();
        assert_eq!(gov.used(), 512);
        drop(handle);
        assert_eq!(gov.used(), 0);
    }

    #[tokio::test]
    async fn pressure_flag_trips_at_eighty_percent() {
        let gov = MemoryGovernor::new(1000);
        let token = CancellationToken::new();
        let mut watcher = token.watcher();

        let _handle = gov.acquire(800, &mut watcher).await.unwrap();
        assert!(gov.under_pressure());
    }

    #[tokio::test]
    async fn acquire_blocks_until_release_then_unblocks() {
        let gov = MemoryGovernor::new(100);
        let token = CancellationToken::new();
        let mut w1 = token.watcher();
        let mut w2 = token.watcher();

        let first = gov.acquire(100, &mut w1).await.unwrap();

        let gov2 = gov.clone();
        let handle = tokio::spawn(async move { gov2.acquire(50, &mut w2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let second = handle.await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_acquire() {
        let gov = MemoryGovernor::new(10);
        let token = CancellationToken::new();
        let mut w1 = token.watcher();
        let mut w2 = token.watcher();

        let _first = gov.acquire(10, &mut w1).await.unwrap();

        let gov2 = gov.clone();
        let handle = tokio::spawn(async move { gov2.acquire(10, &mut w2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.unwrap().is_none());
    }
}

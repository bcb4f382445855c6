//! Worker pool sizing and the adaptive scaling controller (§4.7).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// A scaling decision made by [`AdaptiveController::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Point-in-time metrics the controller evaluates against (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub queue_depth: usize,
    pub worker_count: usize,
    /// Fraction of the evaluation window workers spent idle, in `[0, 1]`.
    pub idle_ratio: f64,
    /// Whether the memory governor has headroom for at least one more
    /// full-size buffer right now.
    pub memory_headroom_for_one_buffer: bool,
}

/// Stateless scaling rules; state (cooldown tracking) lives in the caller
/// so the decision function itself stays trivially testable.
pub struct AdaptiveController {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown: Duration,
}

impl AdaptiveController {
    #[must_use]
    pub fn new(min_workers: usize, max_workers: usize, cooldown: Duration) -> Self {
        Self {
            min_workers,
            max_workers,
            cooldown,
        }
    }

    /// Applies the §4.7 scale-up/scale-down rules against `snapshot`,
    /// given `last_scale_at` (`None` if never scaled).
    #[must_use]
    pub fn evaluate(&self, snapshot: PoolSnapshot, last_scale_at: Option<Instant>) -> ScaleAction {
        let cooldown_elapsed = last_scale_at.is_none_or(|t| t.elapsed() >= self.cooldown);

        if snapshot.worker_count < self.max_workers
            && snapshot.queue_depth > snapshot.worker_count * 2
            && snapshot.memory_headroom_for_one_buffer
            && cooldown_elapsed
        {
            return ScaleAction::ScaleUp;
        }

        if snapshot.worker_count > self.min_workers && snapshot.idle_ratio > 0.5 {
            return ScaleAction::ScaleDown;
        }

        ScaleAction::Hold
    }
}

/// Manages the live worker task count. Each worker is a long-running task
/// produced by a caller-supplied spawn function; scale-down marks a worker
/// for graceful exit after its current item rather than aborting it.
pub struct WorkerPool {
    count: Arc<AtomicUsize>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Registers a freshly spawned worker task. The spawn itself is the
    /// caller's responsibility since a worker needs access to the queue,
    /// governors, and persistence the pool doesn't own.
    #[instrument(skip(self, handle))]
    pub fn register(&self, handle: JoinHandle<()>) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        debug!(workers = self.worker_count(), "worker registered");
    }

    /// Called by a worker task as it exits (scale-down or shutdown) to
    /// keep the count accurate.
    pub fn deregister(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        info!(workers = self.worker_count(), "worker exited");
    }

    /// Awaits all registered worker tasks, e.g. during shutdown.
    pub async fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(queue_depth: usize, worker_count: usize, idle_ratio: f64) -> PoolSnapshot {
        PoolSnapshot {
            queue_depth,
            worker_count,
            idle_ratio,
            memory_headroom_for_one_buffer: true,
        }
    }

    #[test]
    fn scales_up_when_queue_deep_and_headroom_available() {
        let controller = AdaptiveController::new(2, 10, Duration::from_secs(60));
        let action = controller.evaluate(snapshot(10, 2, 0.0), None);
        assert_eq!(action, ScaleAction::ScaleUp);
    }

    #[test]
    fn does_not_scale_up_past_max_workers() {
        let controller = AdaptiveController::new(2, 4, Duration::from_secs(60));
        let action = controller.evaluate(snapshot(100, 4, 0.0), None);
        assert_eq!(action, ScaleAction::Hold);
    }

    #[test]
    fn does_not_scale_up_without_memory_headroom() {
        let controller = AdaptiveController::new(2, 10, Duration::from_secs(60));
        let mut snap = snapshot(10, 2, 0.0);
        snap.memory_headroom_for_one_buffer = false;
        assert_eq!(controller.evaluate(snap, None), ScaleAction::Hold);
    }

    #[test]
    fn respects_cooldown_after_a_recent_scale() {
        let controller = AdaptiveController::new(2, 10, Duration::from_secs(60));
        let action = controller.evaluate(snapshot(10, 2, 0.0), Some(Instant::now()));
        assert_eq!(action, ScaleAction::Hold);
    }

    #[test]
    fn scales_down_when_idle_ratio_high() {
        let controller = AdaptiveController::new(2, 10, Duration::from_secs(60));
        let action = controller.evaluate(snapshot(0, 5, 0.75), None);
        assert_eq!(action, ScaleAction::ScaleDown);
    }

    #[test]
    fn does_not_scale_down_below_min_workers() {
        let controller = AdaptiveController::new(2, 10, Duration::from_secs(60));
        let action = controller.evaluate(snapshot(0, 2, 0.9), None);
        assert_eq!(action, ScaleAction::Hold);
    }

    #[tokio::test]
    async fn pool_register_and_deregister_track_count() {
        let pool = WorkerPool::new();
        let handle = tokio::spawn(async {});
        pool.register(handle);
        assert_eq!(pool.worker_count(), 1);
        pool.join_all().await;
        pool.deregister();
        assert_eq!(pool.worker_count(), 0);
    }
}

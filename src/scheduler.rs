//! Scheduler facade: `Submit`/`Cancel`/`Pause`/`Resume`/`ReprioritizeBatch`/
//! `Snapshot` (§4.2), wiring the queue, governors, worker pool, broadcaster,
//! organizer, and persistence store into one running system.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::broadcaster::Broadcaster;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::download::{classify_error, DownloadError, HttpClient, RetryDecision, RetryPolicy};
use crate::governor::{BandwidthGovernor, MemoryGovernor};
use crate::model::{DownloadItem, DownloadRequest, DownloadStatus, ErrorReason, ItemId, ProgressEvent};
use crate::organizer::{FileOrganizer, LayoutMetadata, OrganizeOutcome};
use crate::persistence::{AttemptRecord, PersistenceStore, StorageError};
use crate::pool::{AdaptiveController, PoolSnapshot, ScaleAction, WorkerPool};
use crate::queue::{composite_priority, PriorityQueue, QueueEntry};
use crate::worker::{run_attempt, AttemptOutcome, WorkerContext};

/// Errors surfaced by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("userPriority must be between 1 and 10, got {0}")]
    InvalidPriority(u8),

    #[error("sourceUrl could not be parsed: {0}")]
    InvalidUrl(String),

    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("item {0} is in state {1:?} and cannot be {2}")]
    IllegalTransition(ItemId, DownloadStatus, &'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A point-in-time view of the scheduler (§4.7, `Snapshot`).
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub queue_depth: usize,
    pub worker_count: usize,
    pub active_items: usize,
}

/// Per-item bookkeeping the scheduler keeps outside the durable store: a
/// cooperative cancellation token scoped to this item, and whether a
/// pending cancellation was requested by `pause` (as opposed to `cancel`).
struct ItemControl {
    cancel: CancellationToken,
    pause_requested: std::sync::atomic::AtomicBool,
}

/// Owns the running system: queue, governors, worker pool, and the
/// glue between them. Cheap to clone (everything inside is `Arc`-backed);
/// share one instance across the embedding service.
pub struct Scheduler {
    config: Config,
    queue: Mutex<PriorityQueue>,
    items: DashMap<ItemId, DownloadItem>,
    controls: DashMap<ItemId, Arc<ItemControl>>,
    persistence: Arc<dyn PersistenceStore>,
    broadcaster: Broadcaster,
    bandwidth: BandwidthGovernor,
    memory: MemoryGovernor,
    http: HttpClient,
    organizer: FileOrganizer,
    pool: WorkerPool,
    controller: AdaptiveController,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    queue_wake: Notify,
    desired_workers: AtomicUsize,
    /// Number of idle workers still owed an exit from a `ScaleDown`
    /// decision. Workers claim one slot each via
    /// [`Scheduler::claim_retirement`] so a single decision retires
    /// exactly one worker even though `notify_waiters` wakes every idle
    /// worker at once.
    pending_retirements: AtomicUsize,
    busy_workers: AtomicUsize,
    last_scale_at: Mutex<Option<Instant>>,
}

impl Scheduler {
    /// Builds and starts a scheduler: spawns `config.min_workers` worker
    /// tasks and, if `config.adaptive_scaling`, the controller loop.
    ///
    /// # Errors
    ///
    /// Returns the first [`crate::config::ConfigError`] found invalid.
    pub fn start(config: Config, persistence: Arc<dyn PersistenceStore>) -> Result<Arc<Self>, crate::config::ConfigError> {
        config.validate()?;

        let scheduler = Arc::new(Self {
            queue: Mutex::new(PriorityQueue::new(config.queue_capacity)),
            items: DashMap::new(),
            controls: DashMap::new(),
            broadcaster: Broadcaster::spawn(1024, Duration::from_millis(250), config.terminal_delivery_grace),
            bandwidth: BandwidthGovernor::new(config.bandwidth_bytes_per_sec, config.bandwidth_bucket_capacity),
            memory: MemoryGovernor::new(config.memory_cap_bytes),
            http: HttpClient::new(Duration::from_secs(10)),
            organizer: FileOrganizer,
            pool: WorkerPool::new(),
            controller: AdaptiveController::new(config.min_workers, config.max_workers, config.scale_cooldown),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            queue_wake: Notify::new(),
            desired_workers: AtomicUsize::new(config.min_workers),
            pending_retirements: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            last_scale_at: Mutex::new(None),
            persistence,
            config,
        });

        for _ in 0..scheduler.config.min_workers {
            scheduler.clone().spawn_worker();
        }
        if scheduler.config.adaptive_scaling {
            scheduler.clone().spawn_controller();
        }

        Ok(scheduler)
    }

    /// Signals shutdown and waits for every worker to finish its current item.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue_wake.notify_waiters();
        self.pool.join_all().await;
    }

    /// Admits a new download request (§4.2 `Submit`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidPriority`] or
    /// [`SchedulerError::InvalidUrl`] if the request fails validation, or
    /// [`SchedulerError::Storage`] if the durable record could not be created.
    #[instrument(skip(self, request), fields(url = %request.source_url))]
    pub async fn submit(&self, request: DownloadRequest) -> Result<ItemId, SchedulerError> {
        if !(1..=10).contains(&request.user_priority) {
            return Err(SchedulerError::InvalidPriority(request.user_priority));
        }
        if url::Url::parse(&request.source_url).is_err() {
            return Err(SchedulerError::InvalidUrl(request.source_url));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();

        let metadata = LayoutMetadata {
            author: request.author.clone(),
            title: request.title.clone(),
            series: request.series.clone(),
        };
        let target_path =
            FileOrganizer::resolve_target_path(&self.config.download_root, &self.config.layout_pattern, &metadata, request.format);

        let mut item = DownloadItem {
            id,
            user_id: request.user_id,
            source_url: request.source_url,
            format: request.format,
            target_path,
            expected_bytes: request.expected_bytes,
            user_priority: request.user_priority,
            status: DownloadStatus::Pending,
            attempts: 0,
            max_attempts: if request.max_attempts > 0 { request.max_attempts } else { self.config.max_attempts },
            created_at: now,
            started_at: None,
            completed_at: None,
            error_reason: None,
            bytes_downloaded: 0,
            book_id: request.book_id,
            source_label: request.source_label,
            original_input: request.original_input,
        };
        item.transition(DownloadStatus::Ready).map_err(|_| SchedulerError::IllegalTransition(id, item.status, "readied"))?;

        let mut watcher = self.shutdown.watcher();
        self.persistence.create_item(&item, &mut watcher).await?;

        let priority = composite_priority(item.user_priority, item.expected_bytes, item.created_at);
        self.items.insert(id, item);
        self.controls.insert(
            id,
            Arc::new(ItemControl {
                cancel: CancellationToken::new(),
                pause_requested: std::sync::atomic::AtomicBool::new(false),
            }),
        );

        let entry = QueueEntry::new(id, priority, None);
        let evicted = {
            let mut queue = self.queue.lock().await;
            queue.push(entry)
        };
        match evicted {
            Ok(Some(evicted)) => self.fail_overflow(evicted.item_id).await,
            Ok(None) => {}
            Err(_) => self.fail_overflow(id).await,
        }

        self.queue_wake.notify_one();
        Ok(id)
    }

    async fn fail_overflow(&self, id: ItemId) {
        if let Some((_, mut item)) = self.items.remove(&id) {
            item.error_reason = Some(ErrorReason::QueueOverflow);
            let _ = item.transition(DownloadStatus::FailedTransient);
            let mut watcher = self.shutdown.watcher();
            let _ = self
                .persistence
                .update_status(id, item.status, item.error_reason, &mut watcher)
                .await;
            self.emit_terminal(&item).await;
        }
        self.controls.remove(&id);
    }

    /// Cancels an item at any non-terminal state (§4.2 `Cancel`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] if `id` is unknown, or
    /// [`SchedulerError::IllegalTransition`] if already terminal.
    pub async fn cancel(&self, id: ItemId) -> Result<(), SchedulerError> {
        let mut item = self.items.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let prior_status = item.status;
        item.transition(DownloadStatus::Cancelled)
            .map_err(|_| SchedulerError::IllegalTransition(id, prior_status, "cancelled"))?;
        drop(item);

        {
            let mut queue = self.queue.lock().await;
            let _ = queue.remove(id);
        }
        if let Some(control) = self.controls.get(&id) {
            control.cancel.cancel();
        }

        let mut watcher = self.shutdown.watcher();
        self.persistence
            .update_status(id, DownloadStatus::Cancelled, None, &mut watcher)
            .await?;

        if let Some(item) = self.items.get(&id) {
            self.emit_terminal(&item).await;
        }
        Ok(())
    }

    /// Pauses a `Ready` or `Active` item (§4.2 `Pause`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or [`SchedulerError::IllegalTransition`].
    pub async fn pause(&self, id: ItemId) -> Result<(), SchedulerError> {
        let mut item = self.items.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let prior_status = item.status;

        if prior_status == DownloadStatus::Ready {
            item.transition(DownloadStatus::Paused)
                .map_err(|_| SchedulerError::IllegalTransition(id, prior_status, "paused"))?;
            drop(item);
            let mut queue = self.queue.lock().await;
            let _ = queue.remove(id);
            drop(queue);
            let mut watcher = self.shutdown.watcher();
            self.persistence
                .update_status(id, DownloadStatus::Paused, None, &mut watcher)
                .await?;
            return Ok(());
        }

        if prior_status == DownloadStatus::Active {
            drop(item);
            if let Some(control) = self.controls.get(&id) {
                control.pause_requested.store(true, Ordering::Release);
                control.cancel.cancel();
            }
            return Ok(());
        }

        Err(SchedulerError::IllegalTransition(id, prior_status, "paused"))
    }

    /// Re-admits a `Paused` item to the queue (§4.2 `Resume`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or [`SchedulerError::IllegalTransition`].
    pub async fn resume(&self, id: ItemId) -> Result<(), SchedulerError> {
        let mut item = self.items.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let prior_status = item.status;
        item.transition(DownloadStatus::Ready)
            .map_err(|_| SchedulerError::IllegalTransition(id, prior_status, "resumed"))?;
        let priority = composite_priority(item.user_priority, item.expected_bytes, item.created_at);
        drop(item);

        self.controls.insert(
            id,
            Arc::new(ItemControl {
                cancel: CancellationToken::new(),
                pause_requested: std::sync::atomic::AtomicBool::new(false),
            }),
        );

        let mut watcher = self.shutdown.watcher();
        self.persistence
            .update_status(id, DownloadStatus::Ready, None, &mut watcher)
            .await?;

        let mut queue = self.queue.lock().await;
        let _ = queue.push(QueueEntry::new(id, priority, None));
        drop(queue);
        self.queue_wake.notify_one();
        Ok(())
    }

    /// Applies `delta` to the `userPriority` of every item in `ids`,
    /// clamped back into the valid `[1, 10]` range. If an item is already
    /// active its compositePriority is still updated but the running
    /// attempt is not preempted; items not currently tracked (already
    /// terminal) are skipped rather than erroring (§4.2 `ReprioritizeBatch`).
    pub async fn reprioritize_batch(&self, ids: &[ItemId], delta: i8) {
        let mut queue = self.queue.lock().await;
        for &id in ids {
            let Some(mut item) = self.items.get_mut(&id) else { continue };
            let adjusted = i32::from(item.user_priority) + i32::from(delta);
            item.user_priority = adjusted.clamp(1, 10) as u8;
            let priority = composite_priority(item.user_priority, item.expected_bytes, item.created_at);
            let _ = queue.reprioritize(id, priority);
        }
    }

    /// A point-in-time view used for external introspection and by tests.
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let queue_depth = self.queue.lock().await.len();
        SchedulerSnapshot {
            queue_depth,
            worker_count: self.pool.worker_count(),
            active_items: self.items.len(),
        }
    }

    /// A live handle to the progress broadcaster, for subscribing.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    async fn emit_terminal(&self, item: &DownloadItem) {
        self.broadcaster
            .publish(ProgressEvent {
                item_id: item.id,
                bytes_done: item.bytes_downloaded,
                bytes_total: item.expected_bytes,
                instantaneous_rate_bps: 0.0,
                smoothed_rate_bps: 0.0,
                eta_seconds: None,
                status: item.status,
                emitted_at: SystemTime::now(),
            })
            .await;
    }

    fn spawn_worker(self: Arc<Self>) {
        let worker_self = self.clone();
        let handle = tokio::spawn(async move {
            worker_self.worker_loop().await;
        });
        self.pool.register(handle);
    }

    fn spawn_controller(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown = self.shutdown.watcher();
            let mut ticker = tokio::time::interval(self.config.eval_period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(action) = self.decide_scaling().await {
                            self.clone().apply_scaling(action);
                        }
                    }
                }
            }
        });
    }

    /// Evaluates the current snapshot against the controller's rules and
    /// records the cooldown timestamp if a scaling action was taken.
    async fn decide_scaling(&self) -> Option<ScaleAction> {
        let queue_depth = self.queue.lock().await.len();
        let worker_count = self.pool.worker_count();
        let busy = self.busy_workers.load(Ordering::Acquire);
        let idle_ratio = if worker_count == 0 {
            0.0
        } else {
            1.0 - (busy as f64 / worker_count as f64)
        };
        let headroom = self.memory.capacity().saturating_sub(self.memory.used()) >= self.config.chunk_size_bytes as u64;

        let snapshot = PoolSnapshot {
            queue_depth,
            worker_count,
            idle_ratio,
            memory_headroom_for_one_buffer: headroom,
        };

        let mut last_scale_at = self.last_scale_at.lock().await;
        let action = self.controller.evaluate(snapshot, *last_scale_at);
        if action != ScaleAction::Hold {
            *last_scale_at = Some(Instant::now());
            Some(action)
        } else {
            None
        }
    }

    /// Applies a scaling decision. Needs `Arc<Self>` since scaling up spawns
    /// a new worker task that must hold its own strong reference.
    fn apply_scaling(self: Arc<Self>, action: ScaleAction) {
        match action {
            ScaleAction::ScaleUp => {
                self.desired_workers.fetch_add(1, Ordering::AcqRel);
                info!(worker_count = self.pool.worker_count() + 1, "scaling worker pool up");
                self.spawn_worker();
            }
            ScaleAction::ScaleDown => {
                self.desired_workers.fetch_sub(1, Ordering::AcqRel);
                self.pending_retirements.fetch_add(1, Ordering::AcqRel);
                self.queue_wake.notify_waiters();
                info!(worker_count = self.pool.worker_count().saturating_sub(1), "scaling worker pool down");
            }
            ScaleAction::Hold => {}
        }
    }

    /// Atomically claims one pending worker retirement, if any remain.
    /// Every idle worker wakes on `queue_wake.notify_waiters()` after a
    /// `ScaleDown`, but only as many of them as `pending_retirements`
    /// counts may actually exit.
    fn claim_retirement(&self) -> bool {
        self.pending_retirements
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn worker_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.watcher();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if self.claim_retirement() {
                break;
            }

            let popped = {
                let mut queue = self.queue.lock().await;
                queue.pop()
            };

            let Some(entry) = popped else {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = self.queue_wake.notified() => {},
                    () = tokio::time::sleep(Duration::from_secs(1)) => {},
                }
                continue;
            };

            self.busy_workers.fetch_add(1, Ordering::AcqRel);
            self.run_item(entry.item_id).await;
            self.busy_workers.fetch_sub(1, Ordering::AcqRel);
        }
        self.pool.deregister();
    }

    #[instrument(skip(self), fields(item_id))]
    async fn run_item(&self, id: ItemId) {
        let Some(control) = self.controls.get(&id).map(|c| c.clone()) else { return };
        let retry_policy = {
            let Some(item) = self.items.get(&id) else { return };
            RetryPolicy::new(item.max_attempts, self.config.retry_backoff_base)
        };
        let worker_ctx = WorkerContext {
            http: self.http.clone(),
            bandwidth: self.bandwidth.clone(),
            memory: self.memory.clone(),
            broadcaster: self.broadcaster.clone(),
            persistence: self.persistence.clone(),
            chunk_size: self.config.chunk_size_bytes,
            attempt_timeout: self.config.attempt_timeout,
            idle_timeout: self.config.idle_timeout,
            progress_interval: self.config.progress_interval,
        };

        loop {
            let Some(mut item) = self.items.get(&id).map(|r| r.clone()) else { return };
            if item.transition(DownloadStatus::Active).is_err() {
                return;
            }
            item.started_at.get_or_insert(SystemTime::now());
            item.attempts += 1;
            self.items.insert(id, item.clone());

            let mut watcher = self.shutdown.watcher();
            let _ = self
                .persistence
                .update_status(id, DownloadStatus::Active, None, &mut watcher)
                .await;
            let _ = self.persistence.update_attempts(id, item.attempts, &mut watcher).await;

            let mut item_watcher = control.cancel.watcher();
            let outcome = run_attempt(&worker_ctx, &item, &mut item_watcher).await;

            match outcome {
                AttemptOutcome::Completed { partial_path, bytes_downloaded } => {
                    self.finish_completed(id, partial_path, bytes_downloaded).await;
                    return;
                }
                AttemptOutcome::ValidationFailed { bytes_downloaded } => {
                    let error = DownloadError::Integrity {
                        path: item.target_path.clone(),
                        detail: "post-download validation failed".to_string(),
                    };
                    if !self
                        .apply_failure(id, &item, error, bytes_downloaded, &retry_policy)
                        .await
                    {
                        return;
                    }
                }
                AttemptOutcome::Failed { error, bytes_downloaded } => {
                    if !self
                        .apply_failure(id, &item, error, bytes_downloaded, &retry_policy)
                        .await
                    {
                        return;
                    }
                }
                AttemptOutcome::Cancelled { bytes_downloaded } => {
                    self.finish_cancelled(id, &control, bytes_downloaded).await;
                    return;
                }
            }
        }
    }

    /// Applies a failed attempt: records it, decides retry vs. give-up.
    /// Returns `true` if the caller should loop for another attempt.
    async fn apply_failure(
        &self,
        id: ItemId,
        item: &DownloadItem,
        error: DownloadError,
        bytes_downloaded: u64,
        retry_policy: &RetryPolicy,
    ) -> bool {
        let reason = error.reason();
        warn!(item_id = id, %error, "attempt failed");

        let mut watcher = self.shutdown.watcher();
        let _ = self
            .persistence
            .record_attempt(
                AttemptRecord {
                    item_id: id,
                    attempt_number: item.attempts,
                    outcome: DownloadStatus::FailedTransient,
                    error_reason: Some(reason),
                    bytes_downloaded,
                },
                &mut watcher,
            )
            .await;

        let failure_type = classify_error(&error);
        let decision = retry_policy.should_retry(failure_type, item.attempts);

        if let Some(mut entry) = self.items.get_mut(&id) {
            entry.bytes_downloaded = bytes_downloaded;
            let _ = entry.transition(DownloadStatus::FailedTransient);
        }

        match decision {
            RetryDecision::Retry { delay, .. } => {
                let mut watcher = self.shutdown.watcher();
                let _ = self
                    .persistence
                    .update_status(id, DownloadStatus::FailedTransient, Some(reason), &mut watcher)
                    .await;

                let control = self.controls.get(&id).map(|c| c.clone());
                let mut item_watcher = control.as_ref().map(|c| c.cancel.watcher());
                tokio::select! {
                    () = async { if let Some(w) = item_watcher.as_mut() { w.cancelled().await } else { std::future::pending::<()>().await } } => {
                        let paused = control.is_some_and(|c| c.pause_requested.swap(false, Ordering::AcqRel));
                        self.finish_cancelled_no_control(id, paused, bytes_downloaded).await;
                        return false;
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                if let Some(mut entry) = self.items.get_mut(&id) {
                    if entry.transition(DownloadStatus::Retrying).is_ok() {
                        let _ = entry.transition(DownloadStatus::Ready);
                    }
                }
                let mut watcher = self.shutdown.watcher();
                let _ = self
                    .persistence
                    .update_status(id, DownloadStatus::Ready, None, &mut watcher)
                    .await;
                true
            }
            RetryDecision::DoNotRetry { .. } => {
                if let Some(mut entry) = self.items.get_mut(&id) {
                    entry.error_reason = Some(reason);
                    entry.completed_at = Some(SystemTime::now());
                    let _ = entry.transition(DownloadStatus::FailedPermanent);
                }
                let mut watcher = self.shutdown.watcher();
                let _ = self
                    .persistence
                    .update_status(id, DownloadStatus::FailedPermanent, Some(reason), &mut watcher)
                    .await;
                if let Some(item) = self.items.get(&id) {
                    self.emit_terminal(&item).await;
                }
                self.controls.remove(&id);
                false
            }
        }
    }

    async fn finish_completed(&self, id: ItemId, partial_path: std::path::PathBuf, bytes_downloaded: u64) {
        let Some(item) = self.items.get(&id).map(|r| r.clone()) else { return };

        let outcome = if self.config.auto_organize {
            self.organizer
                .organize(id, &partial_path, &item.target_path, item.format, item.book_id.clone(), &LayoutMetadata::default())
                .await
        } else {
            Ok(OrganizeOutcome::Placed {
                final_path: item.target_path.clone(),
                file_record: crate::model::FileRecord {
                    item_id: id,
                    absolute_path: item.target_path.clone(),
                    size_bytes: bytes_downloaded,
                    sha256: String::new(),
                    format: item.format,
                    attached_book_id: item.book_id.clone(),
                    is_primary: true,
                },
            })
        };

        let mut watcher = self.shutdown.watcher();
        let reason = match &outcome {
            Ok(OrganizeOutcome::Duplicate { .. }) => Some(ErrorReason::DuplicateOfExisting),
            _ => None,
        };

        if let Ok(outcome) = outcome {
            let (record, is_duplicate) = match outcome {
                OrganizeOutcome::Placed { file_record, .. } => (file_record, false),
                OrganizeOutcome::Duplicate { file_record, .. } => (file_record, true),
            };
            let _ = self.persistence.insert_file_record(record, &mut watcher).await;
            debug!(item_id = id, is_duplicate, "organized completed download");
        }

        if let Some(mut entry) = self.items.get_mut(&id) {
            entry.bytes_downloaded = bytes_downloaded;
            entry.completed_at = Some(SystemTime::now());
            entry.error_reason = reason;
            let _ = entry.transition(DownloadStatus::Completed);
        }
        let mut watcher = self.shutdown.watcher();
        let _ = self
            .persistence
            .update_status(id, DownloadStatus::Completed, reason, &mut watcher)
            .await;
        let _ = self
            .persistence
            .record_attempt(
                AttemptRecord {
                    item_id: id,
                    attempt_number: item.attempts,
                    outcome: DownloadStatus::Completed,
                    error_reason: reason,
                    bytes_downloaded,
                },
                &mut watcher,
            )
            .await;

        if let Some(item) = self.items.get(&id) {
            self.emit_terminal(&item).await;
        }
        self.controls.remove(&id);
    }

    async fn finish_cancelled(&self, id: ItemId, control: &Arc<ItemControl>, bytes_downloaded: u64) {
        let paused = control.pause_requested.swap(false, Ordering::AcqRel);
        self.finish_cancelled_no_control(id, paused, bytes_downloaded).await;
    }

    async fn finish_cancelled_no_control(&self, id: ItemId, paused: bool, bytes_downloaded: u64) {
        let target_status = if paused { DownloadStatus::Paused } else { DownloadStatus::Cancelled };
        let transitioned = if let Some(mut entry) = self.items.get_mut(&id) {
            entry.bytes_downloaded = bytes_downloaded;
            entry.transition(target_status).is_ok()
        } else {
            false
        };
        if transitioned {
            let mut watcher = self.shutdown.watcher();
            let _ = self.persistence.update_status(id, target_status, None, &mut watcher).await;
        }
        if let Some(item) = self.items.get(&id) {
            self.emit_terminal(&item).await;
        }
        if !paused {
            self.controls.remove(&id);
        } else {
            self.controls.insert(
                id,
                Arc::new(ItemControl {
                    cancel: CancellationToken::new(),
                    pause_requested: std::sync::atomic::AtomicBool::new(false),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.min_workers = 1;
        cfg.max_workers = 1;
        cfg.adaptive_scaling = false;
        cfg.download_root = std::env::temp_dir().join("scheduler-test");
        cfg
    }

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            user_id: "u1".into(),
            source_url: url.into(),
            format: crate::model::Format::Epub,
            expected_bytes: Some(1024),
            user_priority: 5,
            max_attempts: 2,
            book_id: None,
            source_label: None,
            original_input: None,
            author: Some("Author".into()),
            title: Some("Title".into()),
            series: None,
        }
    }

    #[tokio::test]
    async fn submit_creates_item_and_admits_to_queue() {
        let scheduler = Scheduler::start(test_config(), Arc::new(InMemoryStore::new())).unwrap();
        let id = scheduler.submit(request("https://example.com/a.epub")).await.unwrap();
        assert!(id >= 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn submit_rejects_out_of_range_priority() {
        let scheduler = Scheduler::start(test_config(), Arc::new(InMemoryStore::new())).unwrap();
        let mut req = request("https://example.com/a.epub");
        req.user_priority = 0;
        assert!(matches!(scheduler.submit(req).await, Err(SchedulerError::InvalidPriority(0))));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_unknown_item_errors() {
        let scheduler = Scheduler::start(test_config(), Arc::new(InMemoryStore::new())).unwrap();
        assert!(matches!(scheduler.cancel(999).await, Err(SchedulerError::NotFound(999))));
        scheduler.shutdown().await;
    }
}

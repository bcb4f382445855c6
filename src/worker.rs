//! Per-attempt download procedure (§4.6).
//!
//! A worker downloads to a `.partial` sibling of the item's `target_path`
//! so that resume offsets are read from a file distinct from the final
//! organized artifact; [`crate::organizer::FileOrganizer`] then finalizes
//! (or discards, on duplicate) that partial file into `target_path`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{instrument, warn};

use crate::broadcaster::Broadcaster;
use crate::cancel::CancellationWatcher;
use crate::download::{detect_login_redirect, DownloadError, HttpClient, BROWSER_USER_AGENT};
use crate::governor::{BandwidthGovernor, MemoryGovernor};
use crate::model::{DownloadItem, DownloadStatus, ProgressEvent};
use crate::persistence::PersistenceStore;

/// Result of a single attempt, before the scheduler applies the resulting
/// state transition and retry decision.
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed { partial_path: PathBuf, bytes_downloaded: u64 },
    /// Validation failed after a clean download; retried like any other
    /// transient failure but with `IntegrityError`/`ValidationFailed`.
    ValidationFailed { bytes_downloaded: u64 },
    Failed { error: DownloadError, bytes_downloaded: u64 },
    Cancelled { bytes_downloaded: u64 },
}

/// Shared dependencies a worker needs to run one attempt. Cloned cheaply;
/// every field is internally an `Arc`/reference-counted handle.
#[derive(Clone)]
pub struct WorkerContext {
    pub http: HttpClient,
    pub bandwidth: BandwidthGovernor,
    pub memory: MemoryGovernor,
    pub broadcaster: Broadcaster,
    pub persistence: Arc<dyn PersistenceStore>,
    pub chunk_size: usize,
    pub attempt_timeout: Duration,
    pub idle_timeout: Duration,
    pub progress_interval: Duration,
}

/// Sibling path used for the in-progress download (§4.6 steps 2-3).
#[must_use]
pub fn partial_path(target_path: &Path) -> PathBuf {
    let mut os = target_path.as_os_str().to_owned();
    os.push(".partial");
    PathBuf::from(os)
}

/// Runs one full attempt against `item`, streaming into its `.partial`
/// sibling file, honoring bandwidth/memory governors, and publishing
/// throttled progress events.
#[instrument(skip(ctx, item, cancel), fields(item_id = item.id, attempt = item.attempts + 1))]
pub async fn run_attempt(ctx: &WorkerContext, item: &DownloadItem, cancel: &mut CancellationWatcher) -> AttemptOutcome {
    let partial = partial_path(&item.target_path);

    if let Some(parent) = partial.parent() {
        if let Err(source) = tokio::fs::create_dir_all(parent).await {
            return AttemptOutcome::Failed {
                error: DownloadError::Io { path: parent.to_path_buf(), source },
                bytes_downloaded: 0,
            };
        }
    }

    let resume_offset = match tokio::fs::metadata(&partial).await {
        Ok(meta) if meta.len() > 0 => Some(meta.len()),
        _ => None,
    };

    let url = match url::Url::parse(&item.source_url) {
        Ok(u) => u,
        Err(_) => {
            return AttemptOutcome::Failed {
                error: DownloadError::Protocol { url: item.source_url.clone(), status: 0 },
                bytes_downloaded: 0,
            }
        }
    };

    let response = match ctx.http.open_stream(&url, resume_offset, ctx.attempt_timeout, None).await {
        Ok(r) => r,
        Err(error) => return AttemptOutcome::Failed { error, bytes_downloaded: resume_offset.unwrap_or(0) },
    };

    // A fresh 403 is often bot-detection rather than a genuine permanent
    // refusal; retry once with a browser-like User-Agent before giving up.
    let response = if response.status().as_u16() == 403 {
        match ctx
            .http
            .open_stream(&url, resume_offset, ctx.attempt_timeout, Some(BROWSER_USER_AGENT))
            .await
        {
            Ok(r) => r,
            Err(error) => return AttemptOutcome::Failed { error, bytes_downloaded: resume_offset.unwrap_or(0) },
        }
    } else {
        response
    };

    let status = response.status().as_u16();

    if status == 200 && detect_login_redirect(&response) {
        return AttemptOutcome::Failed {
            error: DownloadError::Protocol { url: item.source_url.clone(), status },
            bytes_downloaded: resume_offset.unwrap_or(0),
        };
    }

    let (mut file, effective_resume_offset) = match status {
        200 => {
            // §4.6 edge case: resume requested but server ignored it; truncate.
            let file = match tokio::fs::File::create(&partial).await {
                Ok(f) => f,
                Err(source) => {
                    return AttemptOutcome::Failed {
                        error: DownloadError::Io { path: partial.clone(), source },
                        bytes_downloaded: 0,
                    }
                }
            };
            (file, 0)
        }
        206 => {
            let mut file = match tokio::fs::OpenOptions::new().append(true).open(&partial).await {
                Ok(f) => f,
                Err(source) => {
                    return AttemptOutcome::Failed {
                        error: DownloadError::Io { path: partial.clone(), source },
                        bytes_downloaded: 0,
                    }
                }
            };
            let offset = resume_offset.unwrap_or(0);
            if let Err(source) = file.seek(std::io::SeekFrom::End(0)).await {
                return AttemptOutcome::Failed {
                    error: DownloadError::Io { path: partial.clone(), source },
                    bytes_downloaded: offset,
                };
            }
            (file, offset)
        }
        other => {
            return AttemptOutcome::Failed {
                error: DownloadError::Protocol { url: item.source_url.clone(), status: other },
                bytes_downloaded: resume_offset.unwrap_or(0),
            }
        }
    };

    let content_length = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let effective_total = content_length.map(|c| c + effective_resume_offset);

    let mut bytes_done = effective_resume_offset;
    let mut last_publish = Instant::now();
    let mut last_idle_check = Instant::now();
    let mut rate_tracker = RateTracker::new();
    let mut stream = response.bytes_stream();

    loop {
        let next_chunk = tokio::select! {
            () = cancel.cancelled() => {
                return AttemptOutcome::Cancelled { bytes_downloaded: bytes_done };
            }
            chunk = stream.next() => chunk,
            () = tokio::time::sleep(ctx.idle_timeout.saturating_sub(last_idle_check.elapsed())) => {
                return AttemptOutcome::Failed {
                    error: DownloadError::Timeout { url: item.source_url.clone() },
                    bytes_downloaded: bytes_done,
                };
            }
        };

        let Some(chunk) = next_chunk else { break };
        let chunk = match chunk {
            Ok(c) => c,
            Err(source) => {
                return AttemptOutcome::Failed {
                    error: DownloadError::Network { url: item.source_url.clone(), source },
                    bytes_downloaded: bytes_done,
                }
            }
        };
        last_idle_check = Instant::now();

        let Some(buffer) = ctx.memory.acquire(chunk.len() as u64, cancel).await else {
            return AttemptOutcome::Cancelled { bytes_downloaded: bytes_done };
        };

        if !ctx.bandwidth.acquire_bytes(chunk.len() as u64, cancel).await {
            return AttemptOutcome::Cancelled { bytes_downloaded: bytes_done };
        }

        if let Err(source) = file.write_all(&chunk).await {
            return AttemptOutcome::Failed {
                error: DownloadError::Io { path: partial.clone(), source },
                bytes_downloaded: bytes_done,
            };
        }
        drop(buffer);

        bytes_done += chunk.len() as u64;
        rate_tracker.record(chunk.len() as u64);

        if last_publish.elapsed() >= ctx.progress_interval {
            publish_progress(ctx, item, bytes_done, effective_total, &rate_tracker, cancel).await;
            last_publish = Instant::now();
        }
    }

    if let Err(source) = file.sync_all().await {
        return AttemptOutcome::Failed {
            error: DownloadError::Io { path: partial.clone(), source },
            bytes_downloaded: bytes_done,
        };
    }

    publish_progress(ctx, item, bytes_done, effective_total, &rate_tracker, cancel).await;

    match crate::organizer::FileOrganizer::validate(&partial, item.format).await {
        Ok(()) => AttemptOutcome::Completed { partial_path: partial, bytes_downloaded: bytes_done },
        Err(err) => {
            warn!(%err, "validation failed after clean download");
            AttemptOutcome::ValidationFailed { bytes_downloaded: bytes_done }
        }
    }
}

async fn publish_progress(
    ctx: &WorkerContext,
    item: &DownloadItem,
    bytes_done: u64,
    bytes_total: Option<u64>,
    rate: &RateTracker,
    cancel: &mut CancellationWatcher,
) {
    let eta_seconds = match (bytes_total, rate.smoothed_bps()) {
        (Some(total), rate_bps) if rate_bps > 0.0 && total > bytes_done => {
            Some(((total - bytes_done) as f64 / rate_bps) as u64)
        }
        _ => None,
    };
    ctx.broadcaster
        .publish(ProgressEvent {
            item_id: item.id,
            bytes_done,
            bytes_total,
            instantaneous_rate_bps: rate.instantaneous_bps(),
            smoothed_rate_bps: rate.smoothed_bps(),
            eta_seconds,
            status: DownloadStatus::Active,
            emitted_at: SystemTime::now(),
        })
        .await;
    if let Err(err) = ctx.persistence.update_progress(item.id, bytes_done, cancel).await {
        warn!(%err, item_id = item.id, "failed to persist progress");
    }
}

/// Exponential moving average of throughput over a 10 s window (§4.6 step 6).
struct RateTracker {
    samples: Vec<(Instant, u64)>,
    ema_bps: f64,
    last_sample_at: Instant,
}

const RATE_WINDOW: Duration = Duration::from_secs(10);
const EMA_ALPHA: f64 = 0.3;

impl RateTracker {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            ema_bps: 0.0,
            last_sample_at: Instant::now(),
        }
    }

    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at).as_secs_f64().max(0.001);
        let instantaneous = bytes as f64 / elapsed;
        self.ema_bps = EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * self.ema_bps;
        self.last_sample_at = now;

        self.samples.push((now, bytes));
        self.samples.retain(|&(t, _)| now.duration_since(t) <= RATE_WINDOW);
    }

    fn instantaneous_bps(&self) -> f64 {
        let now = Instant::now();
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        let span = self
            .samples
            .first()
            .map(|&(t, _)| now.duration_since(t).as_secs_f64().max(0.001))
            .unwrap_or(1.0);
        total as f64 / span
    }

    fn smoothed_bps(&self) -> f64 {
        self.ema_bps
    }
}

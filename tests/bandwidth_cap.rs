//! End-to-end: a configured bandwidth cap measurably slows a download
//! below what an uncapped transfer of the same body would take.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ebook_acquire_core::config::Config;
use ebook_acquire_core::model::{DownloadRequest, DownloadStatus, Format, ItemId, ProgressEvent};
use ebook_acquire_core::persistence::InMemoryStore;
use ebook_acquire_core::scheduler::Scheduler;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RATE_BPS: u64 = 64 * 1024; // 64 KiB/s, scaled down from the 1 MiB/s reference case
const BUCKET_CAPACITY: u64 = 64 * 1024; // one second of burst
const BODY_SIZE: usize = 3 * 64 * 1024; // 3x the bucket, so throttling must kick in

async fn wait_for_terminal(scheduler: &Arc<Scheduler>, item_id: ItemId) -> ProgressEvent {
    let mut sub = scheduler.broadcaster().subscribe(move |e| e.item_id == item_id).await;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .unwrap()
            .unwrap();
        if event.status.is_terminal() {
            return event;
        }
    }
}

#[tokio::test]
async fn capped_bandwidth_measurably_slows_the_transfer() {
    let mut body = b"PK\x03\x04".to_vec();
    body.extend(std::iter::repeat(b'z').take(BODY_SIZE - body.len()));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let root = tempdir().unwrap();
    let mut config = Config::default();
    config.min_workers = 1;
    config.max_workers = 1;
    config.adaptive_scaling = false;
    config.bandwidth_bytes_per_sec = RATE_BPS;
    config.bandwidth_bucket_capacity = BUCKET_CAPACITY;
    config.chunk_size_bytes = 16 * 1024;
    config.download_root = root.path().to_path_buf();

    let scheduler = Scheduler::start(config, Arc::new(InMemoryStore::new())).unwrap();

    let started_at = Instant::now();
    let id = scheduler
        .submit(DownloadRequest {
            user_id: "u1".into(),
            source_url: format!("{}/a.epub", server.uri()),
            format: Format::Epub,
            expected_bytes: Some(BODY_SIZE as u64),
            user_priority: 5,
            max_attempts: 3,
            book_id: None,
            source_label: None,
            original_input: None,
            author: None,
            title: Some("a".into()),
            series: None,
        })
        .await
        .unwrap();

    let terminal = wait_for_terminal(&scheduler, id).await;
    assert_eq!(terminal.status, DownloadStatus::Completed);

    // The bucket starts full (one second of burst); the remaining
    // BODY_SIZE - BUCKET_CAPACITY bytes can only drain at RATE_BPS, so the
    // transfer cannot finish faster than that residual alone takes.
    let min_expected = Duration::from_secs_f64(
        (BODY_SIZE - BUCKET_CAPACITY as usize) as f64 / RATE_BPS as f64,
    );
    assert!(
        started_at.elapsed() >= min_expected,
        "expected the capped transfer to take at least {min_expected:?}, took {:?}",
        started_at.elapsed()
    );

    scheduler.shutdown().await;
}

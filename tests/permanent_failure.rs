//! End-to-end: a download that exhausts every attempt against a permanent
//! protocol error ends `FailedPermanent` with no file written.

use std::sync::Arc;
use std::time::Duration;

use ebook_acquire_core::cancel::CancellationToken;
use ebook_acquire_core::config::Config;
use ebook_acquire_core::model::{DownloadRequest, DownloadStatus, ErrorReason, Format};
use ebook_acquire_core::persistence::{InMemoryStore, PersistenceStore};
use ebook_acquire_core::scheduler::Scheduler;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_terminal(
    scheduler: &Arc<Scheduler>,
    item_id: u64,
) -> ebook_acquire_core::model::ProgressEvent {
    let mut sub = scheduler.broadcaster().subscribe(move |e| e.item_id == item_id).await;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        if event.status.is_terminal() {
            return event;
        }
    }
}

#[tokio::test]
async fn exhausts_attempts_and_fails_permanently() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.epub"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let root = tempdir().unwrap();
    let mut config = Config::default();
    config.min_workers = 1;
    config.max_workers = 1;
    config.adaptive_scaling = false;
    config.max_attempts = 3;
    config.retry_backoff_base = Duration::from_millis(20);
    config.download_root = root.path().to_path_buf();

    let store = Arc::new(InMemoryStore::new());
    let scheduler = Scheduler::start(config, store.clone() as Arc<dyn PersistenceStore>).unwrap();

    let id = scheduler
        .submit(DownloadRequest {
            user_id: "u1".into(),
            source_url: format!("{}/a.epub", server.uri()),
            format: Format::Epub,
            expected_bytes: None,
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
    assert_eq!(terminal.status, DownloadStatus::FailedPermanent);

    let token = CancellationToken::new();
    let mut watcher = token.watcher();
    let item = store.get(id, &mut watcher).await.unwrap();
    assert_eq!(item.error_reason, Some(ErrorReason::ProtocolError));
    assert_eq!(item.attempts, 3);

    let expected_path = root.path().join("Unknown").join("a").join("a.epub");
    assert!(!expected_path.exists());

    scheduler.shutdown().await;
}

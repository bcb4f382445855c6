//! Fan-out of `ProgressEvent`s to predicate-filtered subscribers (§4.9).
//!
//! A single flush loop drains the bounded input channel, batches events
//! over a flush window (default 250 ms), and delivers the latest event
//! per item to each matching subscriber. A full subscriber buffer drops
//! its oldest queued event rather than blocking the flush loop or the
//! worker that produced the event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{instrument, warn};

use crate::model::{ItemId, ProgressEvent};

type Predicate = Box<dyn Fn(&ProgressEvent) -> bool + Send + Sync>;

/// Per-subscriber bounded buffer with drop-oldest admission.
struct Mailbox {
    capacity: usize,
    queue: Mutex<VecDeque<ProgressEvent>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn push(&self, event: ProgressEvent) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Subscriber {
    id: u64,
    predicate: Predicate,
    mailbox: Arc<Mailbox>,
}

/// A registered subscription.
pub struct SubscriberHandle {
    pub id: u64,
    mailbox: Arc<Mailbox>,
}

impl SubscriberHandle {
    /// Awaits the next delivered event, or `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut queue = self.mailbox.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Batches and fans out [`ProgressEvent`]s to subscribers.
#[derive(Clone)]
pub struct Broadcaster {
    input: mpsc::Sender<ProgressEvent>,
    inner: Arc<Inner>,
    /// How long [`Broadcaster::publish`] blocks to deliver a terminal event
    /// into the input channel before giving up (§9).
    terminal_grace: Duration,
}

/// Per-subscriber mailbox depth before drop-oldest kicks in.
const SUBSCRIBER_MAILBOX_CAPACITY: usize = 64;

impl Broadcaster {
    /// Spawns the flush loop and returns a handle. `input_capacity` bounds
    /// the channel workers publish into; `flush_window` is the batching
    /// interval (§4.9, default 250 ms); `terminal_grace` is how long
    /// `publish` will block to deliver a terminal event under backpressure
    /// before giving up (`Config::terminal_delivery_grace`).
    #[must_use]
    pub fn spawn(input_capacity: usize, flush_window: Duration, terminal_grace: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(input_capacity);
        let inner = Arc::new(Inner {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        let flush_inner = inner.clone();
        tokio::spawn(async move {
            let mut pending: HashMap<ItemId, ProgressEvent> = HashMap::new();
            let mut ticker = tokio::time::interval(flush_window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => { pending.insert(event.item_id, event); }
                            None => {
                                flush(&flush_inner, std::mem::take(&mut pending)).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            flush(&flush_inner, std::mem::take(&mut pending)).await;
                        }
                    }
                }
            }
        });

        Self {
            input: tx,
            inner,
            terminal_grace,
        }
    }

    /// Publishes `event` for eventual fan-out. Drops silently if the flush
    /// loop's input channel is full; per §7, broadcaster errors are logged
    /// and never affect the download itself.
    ///
    /// Terminal events (§9) are exempt from the immediate-drop rule: a full
    /// input channel is retried for up to `terminal_grace` before the event
    /// is given up on, since a dropped terminal event leaves a subscriber
    /// waiting forever for one that will never come.
    #[instrument(skip(self, event), fields(item_id = event.item_id))]
    pub async fn publish(&self, event: ProgressEvent) {
        if event.status.is_terminal() {
            let item_id = event.item_id;
            if tokio::time::timeout(self.terminal_grace, self.input.send(event)).await.is_err() {
                warn!(item_id, "terminal event dropped after grace period, broadcaster input still full");
            }
            return;
        }
        if let Err(err) = self.input.try_send(event) {
            warn!(%err, "broadcaster input full, dropping progress event");
        }
    }

    /// Registers a new subscriber matching events for which `predicate`
    /// returns true.
    pub async fn subscribe(
        &self,
        predicate: impl Fn(&ProgressEvent) -> bool + Send + Sync + 'static,
    ) -> SubscriberHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(SUBSCRIBER_MAILBOX_CAPACITY));
        self.inner.subscribers.lock().await.push(Subscriber {
            id,
            predicate: Box::new(predicate),
            mailbox: mailbox.clone(),
        });
        SubscriberHandle { id, mailbox }
    }

    /// Removes a subscriber by id and closes its mailbox once drained.
    pub async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.inner.subscribers.lock().await;
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            let removed = subscribers.remove(pos);
            removed.mailbox.close();
        }
    }
}

async fn flush(inner: &Inner, batch: HashMap<ItemId, ProgressEvent>) {
    if batch.is_empty() {
        return;
    }
    let subscribers = inner.subscribers.lock().await;
    for sub in subscribers.iter() {
        for event in batch.values() {
            if (sub.predicate)(event) {
                sub.mailbox.push(event.clone()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownloadStatus;
    use std::time::SystemTime;

    fn event(item_id: ItemId, bytes_done: u64) -> ProgressEvent {
        ProgressEvent {
            item_id,
            bytes_done,
            bytes_total: Some(1024),
            instantaneous_rate_bps: 0.0,
            smoothed_rate_bps: 0.0,
            eta_seconds: None,
            status: DownloadStatus::Active,
            emitted_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events() {
        let broadcaster = Broadcaster::spawn(16, Duration::from_millis(20), Duration::from_millis(200));
        let mut sub = broadcaster.subscribe(|e| e.item_id == 1).await;

        broadcaster.publish(event(1, 100)).await;
        broadcaster.publish(event(2, 200)).await;

        let received = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.item_id, 1);
    }

    #[tokio::test]
    async fn flush_window_coalesces_events_for_the_same_item() {
        let broadcaster = Broadcaster::spawn(16, Duration::from_millis(50), Duration::from_millis(200));
        let mut sub = broadcaster.subscribe(|_| true).await;

        broadcaster.publish(event(1, 100)).await;
        broadcaster.publish(event(1, 200)).await;
        broadcaster.publish(event(1, 300)).await;

        let received = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.bytes_done, 300);

        let second = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(second.is_err(), "no second event should arrive within one flush window");
    }

    #[tokio::test]
    async fn drop_oldest_keeps_mailbox_bounded() {
        let mailbox = Mailbox::new(2);
        mailbox.push(event(1, 1)).await;
        mailbox.push(event(1, 2)).await;
        mailbox.push(event(1, 3)).await;

        let mut queue = mailbox.queue.lock().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().bytes_done, 2);
        assert_eq!(queue.pop_front().unwrap().bytes_done, 3);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_mailbox() {
        let broadcaster = Broadcaster::spawn(16, Duration::from_millis(20), Duration::from_millis(200));
        let mut sub = broadcaster.subscribe(|_| true).await;
        broadcaster.unsubscribe(sub.id).await;
        assert!(sub.recv().await.is_none());
    }
}

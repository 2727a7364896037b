//! Forward queue: bounded buffer between decoding and the remote store
//!
//! Producers call [`ForwardQueue::enqueue`], which never blocks: when the
//! buffer is full the new record is handed back and counted as dropped.
//! A single worker drains the buffer one record at a time. A failed upload
//! sleeps for the current backoff, doubles it up to the ceiling, and puts
//! the record back at the tail; a success resets the backoff to its floor.
//!
//! Only one upload is ever in flight.

pub mod backoff;
pub mod uploader;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, Notify};

use crate::config::QueueConfig;
use crate::types::{Payload, Record};

pub use backoff::Backoff;
pub use uploader::{RealtimeDbUploader, RemoteUploader, UploadError};

/// A record waiting for upload and how many times it has been tried.
#[derive(Debug)]
struct QueueItem {
    record: Record,
    attempts: u32,
}

pub struct ForwardQueue {
    items: Mutex<VecDeque<QueueItem>>,
    available: Notify,
    config: QueueConfig,
    dropped: AtomicU64,
    uploaded: AtomicU64,
}

impl ForwardQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::with_capacity(config.capacity.min(4096))),
            available: Notify::new(),
            config,
            dropped: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        })
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append without blocking. On overflow the record is returned and
    /// counted; records already queued are kept.
    pub fn enqueue(&self, record: Record) -> Result<(), Record> {
        {
            let mut items = self.items();
            if items.len() >= self.config.capacity {
                drop(items);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "[forward] queue full ({}), dropping ts={} ({} dropped so far)",
                    self.config.capacity,
                    record.timestamp,
                    dropped
                );
                return Err(record);
            }
            items.push_back(QueueItem { record, attempts: 0 });
        }
        self.available.notify_one();
        Ok(())
    }

    /// Put a failed item back at the tail. Bypasses the capacity check:
    /// an item already accepted is never lost to overflow.
    fn requeue(&self, item: QueueItem) {
        self.items().push_back(item);
        self.available.notify_one();
    }

    async fn next(&self) -> QueueItem {
        loop {
            let next = self.items().pop_front();
            if let Some(item) = next {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Records currently waiting.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records rejected because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records the remote store accepted.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Drain the queue into `uploader` until shutdown. Run exactly one of these.
    pub async fn run_worker(
        self: Arc<Self>,
        uploader: Arc<dyn RemoteUploader>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut backoff = Backoff::new(self.config.backoff_floor, self.config.backoff_ceiling);
        log::info!("[forward] worker started (capacity {})", self.config.capacity);

        loop {
            let item = tokio::select! {
                item = self.next() => item,
                _ = shutdown.recv() => break,
            };
            tokio::select! {
                _ = self.attempt(uploader.as_ref(), item, &mut backoff) => {}
                _ = shutdown.recv() => {
                    log::info!("[forward] shutdown during upload, abandoning in-flight record");
                    break;
                }
            }
        }

        log::info!("[forward] worker stopped with {} records pending", self.len());
    }

    async fn attempt(&self, uploader: &dyn RemoteUploader, mut item: QueueItem, backoff: &mut Backoff) {
        item.attempts += 1;
        let ts = item.record.timestamp;
        // Classified here, at dequeue time.
        let result = match item.record.payload() {
            Payload::Measurement(m) => uploader.upload_measurement(ts, &m).await,
            Payload::Raw(data) => uploader.upload_raw(ts, data).await,
        };

        match result {
            Ok(()) => {
                backoff.reset();
                self.uploaded.fetch_add(1, Ordering::Relaxed);
                log::debug!("[forward] uploaded ts={} after {} attempt(s)", ts, item.attempts);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!(
                    "[forward] upload of ts={} failed on attempt {}: {}; retrying in {:?}",
                    ts,
                    item.attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                self.requeue(item);
            }
        }
    }
}

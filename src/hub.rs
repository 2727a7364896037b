//! Fan-out hub for live subscribers
//!
//! Every decoded record is serialized once and pushed to every attached
//! subscriber concurrently. A subscriber whose send fails, or does not
//! finish within the per-subscriber timeout, is detached; nothing is
//! reported back to the publisher; the sink itself is told through
//! [`SubscriberSink::on_detached`] so its owner can close the connection.
//!
//! The subscriber map is only locked to take a snapshot or to mutate it,
//! never across a send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::types::Record;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Subscriber closed")]
    Closed,

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

/// A live delivery channel, e.g. the outbox of one WebSocket connection.
#[async_trait]
pub trait SubscriberSink: Send + Sync {
    async fn send(&self, text: Arc<str>) -> Result<(), HubError>;

    /// Called once when the hub removes this sink, whoever asked for it.
    fn on_detached(&self) {}
}

/// Identity of an attached subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(Uuid);

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

/// Sink backed by a bounded channel whose receiver is drained by the
/// connection's writer task.
pub struct OutboxSink {
    tx: mpsc::Sender<Arc<str>>,
    detached: Notify,
}

impl OutboxSink {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(depth);
        (
            Self {
                tx,
                detached: Notify::new(),
            },
            rx,
        )
    }

    /// Resolves once the hub has removed this sink, even if that happened
    /// before the call.
    pub async fn detached(&self) {
        self.detached.notified().await
    }
}

#[async_trait]
impl SubscriberSink for OutboxSink {
    async fn send(&self, text: Arc<str>) -> Result<(), HubError> {
        self.tx.send(text).await.map_err(|_| HubError::Closed)
    }

    fn on_detached(&self) {
        self.detached.notify_one();
    }
}

/// Reply to an inbound text frame from a subscriber, if it warrants one.
pub fn reply_to(text: &str) -> Option<&'static str> {
    match text {
        "ping" => Some("pong"),
        _ => None,
    }
}

pub struct FanoutHub {
    subscribers: RwLock<HashMap<Uuid, Arc<dyn SubscriberSink>>>,
    send_timeout: Duration,
    published: AtomicU64,
}

impl FanoutHub {
    pub fn new(send_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
            published: AtomicU64::new(0),
        })
    }

    /// Register a subscriber and send it the current subscriber count.
    ///
    /// If that first message cannot be delivered the subscriber is detached
    /// again straight away.
    pub async fn attach(&self, sink: Arc<dyn SubscriberSink>) -> SubscriberHandle {
        let handle = SubscriberHandle(Uuid::new_v4());
        let count = {
            let mut subs = self.subscribers.write().await;
            subs.insert(handle.0, Arc::clone(&sink));
            subs.len()
        };
        log::info!("[hub] subscriber {} attached ({} live)", handle.0, count);

        let status: Arc<str> = json!({"type": "status", "clients": count}).to_string().into();
        if let Err(e) = self.deliver(sink.as_ref(), status).await {
            log::warn!("[hub] subscriber {} failed on status message: {}", handle.0, e);
            self.detach(handle).await;
        }
        handle
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub async fn detach(&self, handle: SubscriberHandle) -> bool {
        let removed = {
            let mut subs = self.subscribers.write().await;
            subs.remove(&handle.0)
        };
        match removed {
            Some(sink) => {
                log::info!("[hub] subscriber {} detached", handle.0);
                sink.on_detached();
                true
            }
            None => false,
        }
    }

    /// Deliver `record` to every subscriber attached when the call starts.
    /// Returns how many deliveries succeeded.
    pub async fn publish(&self, record: &Record) -> usize {
        let text: Arc<str> = match serde_json::to_string(record) {
            Ok(s) => s.into(),
            Err(e) => {
                log::error!("[hub] cannot serialize record ts={}: {}", record.timestamp, e);
                return 0;
            }
        };

        let snapshot: Vec<(Uuid, Arc<dyn SubscriberSink>)> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|(id, sink)| (*id, Arc::clone(sink))).collect()
        };
        if snapshot.is_empty() {
            return 0;
        }

        let results = join_all(snapshot.iter().map(|(id, sink)| {
            let text = Arc::clone(&text);
            async move { (*id, self.deliver(sink.as_ref(), text).await) }
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!(
                        "[hub] dropping subscriber {} after failed send of ts={}: {}",
                        id,
                        record.timestamp,
                        e
                    );
                    failed.push(id);
                }
            }
        }
        if !failed.is_empty() {
            // A concurrent detach may already have taken some of these.
            let removed: Vec<Arc<dyn SubscriberSink>> = {
                let mut subs = self.subscribers.write().await;
                failed.iter().filter_map(|id| subs.remove(id)).collect()
            };
            for sink in removed {
                sink.on_detached();
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Number of currently attached subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Records published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) async fn detach_all(&self) {
        let ids: Vec<Uuid> = self.subscribers.read().await.keys().copied().collect();
        for id in ids {
            self.detach(SubscriberHandle(id)).await;
        }
    }

    async fn deliver(&self, sink: &dyn SubscriberSink, text: Arc<str>) -> Result<(), HubError> {
        match tokio::time::timeout(self.send_timeout, sink.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout(self.send_timeout)),
        }
    }
}

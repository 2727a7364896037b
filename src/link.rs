//! Device link: the radio connection lifecycle
//!
//! ```text
//! Disconnected → Scanning → Connecting → Subscribed → Streaming → Disconnected
//!                  ↑  │ not found (rescan delay)                     │
//!                  └──┴────────── error (reconnect delay) ◄──────────┘
//! ```
//!
//! The loop never ends on its own. Every failure while scanning,
//! connecting or streaming is logged and sends the link back to scanning;
//! only the shutdown signal stops it. Notification chunks are consumed on
//! this task, so the frame decoder needs no locking.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use crate::ble::transport::{BleCentral, BleConnection, DiscoveredPeripheral};
use crate::ble::BleError;
use crate::config::LinkConfig;
use crate::framing::FrameDecoder;
use crate::types::Record;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    Subscribed,
    Streaming,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::Subscribed => "subscribed",
            LinkState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Receives every record the link decodes. Must not block.
pub trait RecordSink: Send + Sync {
    fn accept(&self, record: Record);
}

/// How one scan/connect/stream cycle ended.
#[derive(Debug, PartialEq, Eq)]
enum CycleEnd {
    NotFound,
    LinkLost,
}

pub struct DeviceLink {
    central: Arc<dyn BleCentral>,
    config: LinkConfig,
    sink: Arc<dyn RecordSink>,
    state: watch::Sender<LinkState>,
}

impl DeviceLink {
    pub fn new(central: Arc<dyn BleCentral>, config: LinkConfig, sink: Arc<dyn RecordSink>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            central,
            config,
            sink,
            state,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("[link] {} -> {}", prev, next);
        }
    }

    /// Keep the device connected until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut decoder = FrameDecoder::with_max_line(self.config.max_line);
        loop {
            let result = tokio::select! {
                result = self.cycle(&mut decoder) => result,
                _ = shutdown.recv() => break,
            };
            // Whatever happened, a half line from this session must not
            // be completed by the next one.
            decoder.reset();
            self.set_state(LinkState::Disconnected);

            let delay = match result {
                Ok(CycleEnd::LinkLost) => {
                    log::info!("[link] disconnected, will rescan");
                    None
                }
                Ok(CycleEnd::NotFound) => {
                    log::info!("[link] device not found, retrying scan");
                    Some(self.config.rescan_delay)
                }
                Err(e) => {
                    log::warn!("[link] error: {}", e);
                    Some(self.config.reconnect_delay)
                }
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }
        decoder.reset();
        self.set_state(LinkState::Disconnected);
        log::info!("[link] stopped");
    }

    /// Name match first; otherwise the first device advertising the service.
    fn pick<'a>(&self, found: &'a [DiscoveredPeripheral]) -> Option<&'a DiscoveredPeripheral> {
        found
            .iter()
            .find(|p| p.name.as_deref() == Some(self.config.device_name.as_str()))
            .or_else(|| found.iter().find(|p| p.advertises(&self.config.service_uuid)))
    }

    async fn cycle(&self, decoder: &mut FrameDecoder) -> Result<CycleEnd, BleError> {
        self.set_state(LinkState::Scanning);
        log::info!(
            "[link] scanning for '{}' (or service {})",
            self.config.device_name,
            self.config.service_uuid
        );
        let found = self.central.scan(self.config.scan_timeout).await?;
        let target = match self.pick(&found) {
            Some(target) => target,
            None => return Ok(CycleEnd::NotFound),
        };

        self.set_state(LinkState::Connecting);
        log::info!(
            "[link] connecting to {} (name={})",
            target.address,
            target.name.as_deref().unwrap_or("?")
        );
        let conn = self.central.connect(target).await?;

        let result = self.stream(conn.as_ref(), decoder).await;
        if let Err(e) = conn.disconnect().await {
            log::debug!("[link] disconnect after session: {}", e);
        }
        result
    }

    async fn stream(&self, conn: &dyn BleConnection, decoder: &mut FrameDecoder) -> Result<CycleEnd, BleError> {
        let mut chunks = conn.subscribe(self.config.notify_uuid).await?;
        self.set_state(LinkState::Subscribed);
        log::info!("[link] subscribed to {} on {}", self.config.notify_uuid, conn.peer_address());

        decoder.reset();
        self.set_state(LinkState::Streaming);
        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => self.on_chunk(decoder, &chunk),
                    None => return Ok(CycleEnd::LinkLost),
                },
                _ = liveness.tick() => {
                    if !conn.is_connected().await {
                        drain_ready(&mut chunks, |chunk| self.on_chunk(decoder, &chunk));
                        return Ok(CycleEnd::LinkLost);
                    }
                }
            }
        }
    }

    fn on_chunk(&self, decoder: &mut FrameDecoder, chunk: &[u8]) {
        let out = decoder.feed(chunk);
        for e in out.errors {
            log::warn!("[link] dropped line: {}", e);
        }
        for record in out.records {
            self.sink.accept(record);
        }
    }
}

/// Hand over chunks that already arrived before the link was found dead.
fn drain_ready(chunks: &mut mpsc::Receiver<Vec<u8>>, mut f: impl FnMut(Vec<u8>)) {
    while let Ok(chunk) = chunks.try_recv() {
        f(chunk);
    }
}

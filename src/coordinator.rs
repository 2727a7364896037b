//! Wiring: one device link feeding the audit log, the live hub and the
//! forward queue
//!
//! The link hands each record to a [`Dispatcher`], which passes it to the
//! audit writer over an ordered channel, to the hub's publisher task over a
//! bounded channel, and enqueues it for upload. None of the three can block
//! the link or each other.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audit::{AuditError, AuditSink};
use crate::ble::transport::BleCentral;
use crate::config::BridgeConfig;
use crate::forward::{ForwardQueue, RemoteUploader};
use crate::hub::FanoutHub;
use crate::link::{DeviceLink, LinkState, RecordSink};
use crate::server::{self, ServerError, ServerState, StatusSnapshot};
use crate::types::Record;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Side effects of one decoded record.
struct Dispatcher {
    audit: mpsc::UnboundedSender<Record>,
    fanout: mpsc::Sender<Record>,
    queue: Arc<ForwardQueue>,
}

impl RecordSink for Dispatcher {
    fn accept(&self, record: Record) {
        if self.audit.send(record.clone()).is_err() {
            log::error!("[audit] writer gone, ts={} not logged", record.timestamp);
        }
        match self.fanout.try_send(record.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                log::warn!("[hub] publisher backlogged, live view skips ts={}", r.timestamp);
            }
            Err(TrySendError::Closed(_)) => {}
        }
        // Overflow is counted and logged by the queue.
        let _ = self.queue.enqueue(record);
    }
}

async fn publish_loop(hub: Arc<FanoutHub>, mut records: mpsc::Receiver<Record>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let record = tokio::select! {
            record = records.recv() => record,
            _ = shutdown.recv() => break,
        };
        match record {
            Some(record) => {
                hub.publish(&record).await;
            }
            None => break,
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    central: Arc<dyn BleCentral>,
    uploader: Arc<dyn RemoteUploader>,
    hub: Arc<FanoutHub>,
    queue: Arc<ForwardQueue>,
    audit: Arc<AuditSink>,
}

impl Bridge {
    /// Open the audit log and build the components. Nothing runs yet.
    pub fn new(
        config: BridgeConfig,
        central: Arc<dyn BleCentral>,
        uploader: Arc<dyn RemoteUploader>,
    ) -> Result<Self, BridgeError> {
        let audit = Arc::new(AuditSink::open(&config.audit)?);
        log::info!(
            "[audit] logging to {} and {}",
            audit.jsonl_path().display(),
            audit.csv_path().display()
        );
        Ok(Self {
            hub: FanoutHub::new(config.hub.send_timeout),
            queue: ForwardQueue::new(config.queue.clone()),
            audit,
            config,
            central,
            uploader,
        })
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn queue(&self) -> &Arc<ForwardQueue> {
        &self.queue
    }

    /// Spawn every task and return a handle to the running bridge.
    pub fn start(self) -> Result<RunningBridge, BridgeError> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (fanout_tx, fanout_rx) = mpsc::channel(self.config.hub.fanout_depth);
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Dispatcher {
            audit: audit_tx,
            fanout: fanout_tx,
            queue: Arc::clone(&self.queue),
        });
        let link = Arc::new(DeviceLink::new(self.central, self.config.link.clone(), dispatcher));
        let link_state = link.subscribe_state();

        let state = ServerState {
            hub: Arc::clone(&self.hub),
            queue: Arc::clone(&self.queue),
            link: link.subscribe_state(),
            outbox_depth: self.config.hub.outbox_depth,
            shutdown: shutdown_tx.clone(),
        };
        let mut server_stop = shutdown_tx.subscribe();
        let (http_addr, server) = server::bind(self.config.http_addr, state.clone(), async move {
            let _ = server_stop.recv().await;
        })?;

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push(("http", tokio::spawn(server)));
        let link_shutdown = shutdown_tx.subscribe();
        tasks.push(("link", tokio::spawn(async move { link.run(link_shutdown).await })));
        tasks.push((
            "forward",
            tokio::spawn(Arc::clone(&self.queue).run_worker(self.uploader, shutdown_tx.subscribe())),
        ));
        tasks.push((
            "publisher",
            tokio::spawn(publish_loop(Arc::clone(&self.hub), fanout_rx, shutdown_tx.subscribe())),
        ));
        // Ends once the link task drops the dispatcher, after the backlog is written.
        tasks.push(("audit", tokio::spawn(Arc::clone(&self.audit).run_writer(audit_rx))));

        Ok(RunningBridge {
            http_addr,
            link_state,
            state,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    /// Run until `signal` completes, then stop every task.
    pub async fn run(self, signal: impl Future<Output = ()>) -> Result<(), BridgeError> {
        let running = self.start()?;
        signal.await;
        log::info!("shutdown requested");
        running.stop().await;
        Ok(())
    }
}

pub struct RunningBridge {
    http_addr: SocketAddr,
    link_state: watch::Receiver<LinkState>,
    state: ServerState,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningBridge {
    /// Address the HTTP surface actually bound, useful with port 0.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.state.status().await
    }

    /// Signal shutdown and wait for every task. The link is joined before
    /// the audit writer, so every decoded record reaches the audit log.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                log::error!("{} task ended abnormally: {}", name, e);
            }
        }
        log::info!("bridge stopped");
    }
}

//! End-to-end: simulated wearable → bridge → live subscriber, remote store
//! and audit log.
//!
//! Run with:
//!   cargo test --test bridge_end_to_end

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use vitals_bridge::ble::simulated::{SimBleCentral, SimPeripheralHandle};
use vitals_bridge::forward::{RemoteUploader, UploadError};
use vitals_bridge::hub::{HubError, SubscriberSink};
use vitals_bridge::{Bridge, BridgeConfig, Measurement, RunningBridge};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Upload {
    Measurement(i64, Measurement),
    Raw(i64, Value),
}

/// Records every successful upload; fails while `offline` is set.
#[derive(Default)]
struct RecordingUploader {
    offline: AtomicBool,
    uploads: Mutex<Vec<Upload>>,
}

impl RecordingUploader {
    fn check(&self) -> Result<(), UploadError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(UploadError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteUploader for RecordingUploader {
    async fn upload_measurement(&self, timestamp: i64, measurement: &Measurement) -> Result<(), UploadError> {
        self.check()?;
        self.uploads
            .lock()
            .unwrap()
            .push(Upload::Measurement(timestamp, measurement.clone()));
        Ok(())
    }

    async fn upload_raw(&self, timestamp: i64, data: &Value) -> Result<(), UploadError> {
        self.check()?;
        self.uploads.lock().unwrap().push(Upload::Raw(timestamp, data.clone()));
        Ok(())
    }
}

struct ChannelSink(mpsc::UnboundedSender<Value>);

#[async_trait]
impl SubscriberSink for ChannelSink {
    async fn send(&self, text: Arc<str>) -> Result<(), HubError> {
        let value = serde_json::from_str(&text).map_err(|_| HubError::Closed)?;
        self.0.send(value).map_err(|_| HubError::Closed)
    }
}

struct Setup {
    _dir: TempDir,
    dir_path: std::path::PathBuf,
    wearable: SimPeripheralHandle,
    uploader: Arc<RecordingUploader>,
    live: mpsc::UnboundedReceiver<Value>,
    running: RunningBridge,
}

async fn start_bridge(offline: bool) -> Setup {
    let dir = TempDir::new().unwrap();
    let central = SimBleCentral::new();
    let wearable = central.add_wearable(Some("ESP32-SaudeRemota"));
    let uploader = Arc::new(RecordingUploader::default());
    uploader.offline.store(offline, Ordering::SeqCst);

    let mut config = BridgeConfig::default();
    config.http_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.audit.dir = dir.path().join("logs");
    config.queue.backoff_floor = Duration::from_millis(10);
    config.queue.backoff_ceiling = Duration::from_millis(40);

    let bridge = Bridge::new(config, central, Arc::clone(&uploader) as Arc<dyn RemoteUploader>).unwrap();
    let (tx, live) = mpsc::unbounded_channel();
    bridge.hub().attach(Arc::new(ChannelSink(tx))).await;
    let running = bridge.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), wearable.wait_for_subscriptions(1))
        .await
        .expect("link never subscribed");

    Setup {
        dir_path: dir.path().join("logs"),
        _dir: dir,
        wearable,
        uploader,
        live,
        running,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_live(live: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), live.recv())
        .await
        .expect("no live message")
        .expect("live channel closed")
}

const MEASUREMENT_LINE: &[u8] = b"{\"ts\":1000,\"data\":{\"temperature\":36.6,\"heartRate\":72,\"oxygenSaturation\":98,\"modelConfidence\":0.9,\"riskScore\":0.1}}\n";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_records_reach_every_consumer() {
    let mut s = start_bridge(false).await;
    assert_eq!(next_live(&mut s.live).await, json!({"type": "status", "clients": 1}));

    let (head, tail) = MEASUREMENT_LINE.split_at(17);
    s.wearable.notify(head).await;
    s.wearable.notify(tail).await;
    s.wearable.notify(b"not json\n{\"ts\":1001,\"data\":{\"battery\":80}}\n").await;

    // Live view in decode order; the garbage line never shows up.
    assert_eq!(next_live(&mut s.live).await["ts"], json!(1000));
    assert_eq!(next_live(&mut s.live).await, json!({"ts": 1001, "data": {"battery": 80}}));

    let uploader = Arc::clone(&s.uploader);
    eventually("two uploads", || uploader.uploads().len() == 2).await;
    let uploads = s.uploader.uploads();
    assert!(matches!(uploads[0], Upload::Measurement(1000, ref m) if m.heart_rate == 72.0));
    assert_eq!(uploads[1], Upload::Raw(1001, json!({"battery": 80})));

    // The audit log is written off the link task, so it may trail the uploads.
    let lines = |name: &str| {
        std::fs::read_to_string(s.dir_path.join(name))
            .map(|text| text.lines().count())
            .unwrap_or(0)
    };
    eventually("audit log", || lines("raw_log.jsonl") == 2 && lines("raw_log.csv") == 3).await;
    let csv = std::fs::read_to_string(s.dir_path.join("raw_log.csv")).unwrap();
    assert!(csv.starts_with("timestamp_ms,iso_time,temperature,"));

    let url = format!("http://{}/status", s.running.http_addr());
    let status: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(status["clients"], json!(1));
    assert_eq!(status["link"], json!("streaming"));

    s.running.stop().await;
}

#[tokio::test]
async fn test_remote_outage_does_not_stall_live_view() {
    let mut s = start_bridge(true).await;
    next_live(&mut s.live).await;

    for ts in 1..=3 {
        let line = format!("{{\"ts\":{},\"data\":{{\"n\":{}}}}}\n", ts, ts);
        s.wearable.notify(line.as_bytes()).await;
    }
    for ts in 1..=3 {
        assert_eq!(next_live(&mut s.live).await["ts"], json!(ts));
    }
    assert!(s.uploader.uploads().is_empty());

    s.uploader.offline.store(false, Ordering::SeqCst);
    let uploader = Arc::clone(&s.uploader);
    eventually("backlog uploaded", || uploader.uploads().len() == 3).await;

    let mut seen: Vec<i64> = s
        .uploader
        .uploads()
        .into_iter()
        .map(|u| match u {
            Upload::Raw(ts, _) | Upload::Measurement(ts, _) => ts,
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = s.running.status().await;
        if status.uploaded == 3 {
            assert_eq!(status.queue_depth, 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "uploaded counter stuck at {}", status.uploaded);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    s.running.stop().await;
}

#[tokio::test]
async fn test_reconnect_keeps_bridge_running() {
    let mut s = start_bridge(false).await;
    next_live(&mut s.live).await;

    s.wearable.notify(b"{\"ts\":1,\"da").await;
    s.wearable.drop_link();
    tokio::time::timeout(Duration::from_secs(5), s.wearable.wait_for_subscriptions(2))
        .await
        .expect("link never came back");

    s.wearable.notify(b"ta\":{}}\n{\"ts\":2,\"data\":{}}\n").await;
    assert_eq!(next_live(&mut s.live).await, json!({"ts": 2, "data": {}}));

    s.running.stop().await;
}

#[tokio::test]
async fn test_stop_flushes_audit_backlog() {
    let mut s = start_bridge(false).await;
    next_live(&mut s.live).await;

    let mut burst = String::new();
    for ts in 1..=50 {
        burst.push_str(&format!("{{\"ts\":{},\"data\":{{\"n\":{}}}}}\n", ts, ts));
    }
    s.wearable.notify(burst.as_bytes()).await;
    assert_eq!(next_live(&mut s.live).await["ts"], json!(1));

    let uploader = Arc::clone(&s.uploader);
    eventually("burst decoded", || uploader.uploads().len() == 50).await;
    s.running.stop().await;

    // Nothing decoded before stop is missing from the log, and order holds.
    let jsonl = std::fs::read_to_string(s.dir_path.join("raw_log.jsonl")).unwrap();
    let seen: Vec<i64> = jsonl
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["ts"].as_i64().unwrap())
        .collect();
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());
}

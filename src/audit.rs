//! Append-only audit log
//!
//! Every decoded record is written twice: verbatim as one JSON line, and as
//! one row of a CSV table with fixed measurement columns. Both files are
//! opened in append mode per record, so external rotation or deletion is
//! picked up on the next write; a missing or empty CSV gets its header back.
//!
//! File I/O never runs on the decode path: records reach the files through
//! [`AuditSink::run_writer`], which drains an ordered channel and performs
//! the writes on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AuditConfig;
use crate::types::{Payload, Record};

/// Largest batch handed to one blocking write.
const MAX_BATCH: usize = 256;

pub const CSV_HEADER: [&str; 8] = [
    "timestamp_ms",
    "iso_time",
    "temperature",
    "heartRate",
    "oxygenSaturation",
    "modelConfidence",
    "riskScore",
    "json_raw",
];

const MEASUREMENT_COLUMNS: [&str; 5] = [
    "temperature",
    "heartRate",
    "oxygenSaturation",
    "modelConfidence",
    "riskScore",
];

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// ISO-8601 UTC with milliseconds, or empty when the timestamp is out of range.
fn iso_time(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

pub struct AuditSink {
    jsonl_path: PathBuf,
    csv_path: PathBuf,
    /// Serializes writers so rows from concurrent appends never interleave.
    write_lock: Mutex<()>,
}

impl AuditSink {
    /// Create the log directory if needed.
    pub fn open(config: &AuditConfig) -> Result<Self, AuditError> {
        fs::create_dir_all(&config.dir).map_err(io_err(&config.dir))?;
        Ok(Self {
            jsonl_path: config.jsonl_path(),
            csv_path: config.csv_path(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn jsonl_path(&self) -> &Path {
        &self.jsonl_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Write `record` to both logs.
    pub fn append(&self, record: &Record) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        let data = serde_json::to_string(&record.data)?;
        // Measurements go through the typed form so the firmware's legacy
        // field names land in the right columns.
        let [temperature, heart_rate, oxygen, confidence, risk] = match record.payload() {
            Payload::Measurement(m) => [
                m.temperature,
                m.heart_rate,
                m.oxygen_saturation,
                m.model_confidence,
                m.risk_score,
            ]
            .map(|v| v.to_string()),
            Payload::Raw(_) => MEASUREMENT_COLUMNS.map(|name| {
                record
                    .numeric_field(name)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            }),
        };
        let row = [
            record.timestamp.to_string(),
            iso_time(record.timestamp),
            temperature,
            heart_rate,
            oxygen,
            confidence,
            risk,
            data,
        ];

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut jsonl = append_to(&self.jsonl_path)?;
        writeln!(jsonl, "{}", line).map_err(io_err(&self.jsonl_path))?;

        let csv_file = append_to(&self.csv_path)?;
        let needs_header = csv_file
            .metadata()
            .map(|m| m.len() == 0)
            .map_err(io_err(&self.csv_path))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(csv_file);
        if needs_header {
            writer.write_record(CSV_HEADER)?;
        }
        writer.write_record(&row)?;
        writer.flush().map_err(io_err(&self.csv_path))?;
        Ok(())
    }

    /// Write every record received on `records`, in order, until all
    /// senders are gone. Whatever is already queued is written before this
    /// returns, so a record is never cut off by shutdown.
    pub async fn run_writer(self: Arc<Self>, mut records: mpsc::UnboundedReceiver<Record>) {
        let mut written: u64 = 0;
        while let Some(first) = records.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match records.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
            written += batch.len() as u64;

            let sink = Arc::clone(&self);
            let result = tokio::task::spawn_blocking(move || {
                for record in &batch {
                    if let Err(e) = sink.append(record) {
                        log::error!("[audit] failed to log ts={}: {}", record.timestamp, e);
                    }
                }
            })
            .await;
            if let Err(e) = result {
                log::error!("[audit] write task failed: {}", e);
            }
        }
        log::info!("[audit] writer stopped after {} records", written);
    }
}

fn append_to(path: &Path) -> Result<File, AuditError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))
}

//! Newline-delimited JSON framing
//!
//! The wearable writes one JSON object per line, `{"ts":<ms>,"data":{..}}`,
//! and the radio chops that byte stream into notification chunks of whatever
//! size the link negotiated. [`FrameDecoder`] reassembles lines across chunk
//! boundaries and turns each one into a [`Record`].
//!
//! A decoder belongs to one link session. The Device Link calls
//! [`FrameDecoder::reset`] whenever the session ends so that a half-received
//! line never gets completed by bytes from the next connection.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;

use crate::types::Record;

/// Longest undelimited line kept in the buffer before it is thrown away.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Line exceeded {limit} bytes without a delimiter")]
    LineTooLong { limit: usize },
}

/// Output of one [`FrameDecoder::feed`] call.
#[derive(Debug, Default)]
pub struct FeedResult {
    /// Records completed by this chunk, in stream order.
    pub records: Vec<Record>,
    /// Lines dropped while processing this chunk.
    pub errors: Vec<FrameError>,
}

fn wall_clock_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `ts` may arrive as an integer or a float; floats are truncated.
fn millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

pub struct FrameDecoder {
    buffer: BytesMut,
    max_line: usize,
    /// Set after an oversized line was cut; cleared at the next delimiter.
    discarding: bool,
    clock: fn() -> i64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
            max_line,
            discarding: false,
            clock: wall_clock_millis,
        }
    }

    /// Replace the clock used to stamp records that arrive without `ts`.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Append a chunk and extract every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedResult {
        let mut out = FeedResult::default();
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let frame = self.buffer.split_to(pos + 1);
            if self.discarding {
                // Tail of a line that was already reported as too long.
                self.discarding = false;
                continue;
            }
            let line = &frame[..pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match self.decode_line(line) {
                Ok(record) => out.records.push(record),
                Err(e) => out.errors.push(e),
            }
        }

        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            if !self.discarding {
                out.errors.push(FrameError::LineTooLong {
                    limit: self.max_line,
                });
            }
            self.discarding = true;
        }

        out
    }

    /// Drop any partially received line.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Bytes buffered waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&self, line: &[u8]) -> Result<Record, FrameError> {
        let text = std::str::from_utf8(line)?;
        let value: Value = serde_json::from_str(text)?;
        Ok(self.to_record(value))
    }

    fn to_record(&self, mut value: Value) -> Record {
        let ts = value.get("ts").and_then(millis);
        let data = value.as_object_mut().and_then(|obj| obj.remove("data"));
        match (ts, data) {
            (Some(ts), Some(data)) => Record::new(ts, data),
            (ts, data) => Record::new(
                ts.unwrap_or_else(|| (self.clock)()),
                data.unwrap_or(value),
            ),
        }
    }
}

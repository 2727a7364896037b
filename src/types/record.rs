//! types/record.rs
//!
//! Defines the Record that flows from the radio link to every consumer, and
//! the Measurement shape recognised inside its `data` object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One physiological sample as emitted by the wearable.
///
/// The firmware's older field names (`bmp`, `spo2`, `modelPreccision`) are
/// accepted on input; output always uses the canonical names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Measurement {
    /// Body temperature in °C.
    pub temperature: f64,
    /// Beats per minute.
    #[serde(rename = "heartRate", alias = "bmp")]
    pub heart_rate: f64,
    /// Blood oxygen saturation in percent.
    #[serde(rename = "oxygenSaturation", alias = "spo2")]
    pub oxygen_saturation: f64,
    /// On-device model confidence, 0.0 to 1.0.
    #[serde(rename = "modelConfidence", alias = "modelPreccision")]
    pub model_confidence: f64,
    /// On-device risk estimate, 0.0 to 1.0.
    #[serde(rename = "riskScore")]
    pub risk_score: f64,
}

impl Measurement {
    /// Interpret a JSON value as a measurement, if it has exactly the
    /// measurement fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        Measurement::deserialize(value).ok()
    }

    /// Copy with every field rounded to two decimals.
    pub fn rounded(&self) -> Self {
        fn r2(v: f64) -> f64 {
            (v * 100.0).round() / 100.0
        }
        Self {
            temperature: r2(self.temperature),
            heart_rate: r2(self.heart_rate),
            oxygen_saturation: r2(self.oxygen_saturation),
            model_confidence: r2(self.model_confidence),
            risk_score: r2(self.risk_score),
        }
    }
}

/// The two shapes a record's `data` can take.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload<'a> {
    Measurement(Measurement),
    /// Anything else: diagnostics, keep-alives, partial readings.
    Raw(&'a Value),
}

/// A decoded record, serialized as the device wire object `{"ts":..,"data":..}`.
///
/// `data` is kept exactly as received; [`Record::payload`] classifies it on
/// demand so every consumer sees the same verbatim object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Milliseconds since the Unix epoch, producer-assigned.
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(rename = "data")]
    pub data: Value,
}

impl Record {
    pub fn new(timestamp: i64, data: Value) -> Self {
        Self { timestamp, data }
    }

    /// Build a record from a measurement, using the canonical field names.
    pub fn measurement(timestamp: i64, measurement: &Measurement) -> Self {
        let data = serde_json::to_value(measurement).unwrap_or(Value::Null);
        Self { timestamp, data }
    }

    /// Classify `data`. Not cached: callers re-derive it when they need it.
    pub fn payload(&self) -> Payload<'_> {
        match Measurement::from_value(&self.data) {
            Some(m) => Payload::Measurement(m),
            None => Payload::Raw(&self.data),
        }
    }

    /// Numeric field of `data` by name, for tabular output.
    pub fn numeric_field(&self, name: &str) -> Option<f64> {
        self.data.get(name).and_then(Value::as_f64)
    }
}

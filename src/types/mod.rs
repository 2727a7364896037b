//! Data types shared across the bridge.

pub mod record;

pub use record::{Measurement, Payload, Record};

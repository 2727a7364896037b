// Vitals bridge - BLE wearable to live subscribers, audit log and remote store

pub mod audit;
pub mod ble;
pub mod config;
pub mod coordinator;
pub mod forward;
pub mod framing;
pub mod hub;
pub mod link;
pub mod server;
pub mod types;

pub use config::BridgeConfig;
pub use coordinator::{Bridge, BridgeError, RunningBridge};
pub use link::{LinkState, RecordSink};
pub use types::{Measurement, Payload, Record};

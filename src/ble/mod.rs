//! BLE transport layer for the wearable link
//!
//! Provides the central-role abstraction traits, the Nordic UART Service
//! identifiers the wearable exposes, a simulated transport for testing,
//! and (behind `ble-central`) a btleplug-backed implementation.

#[cfg(feature = "ble-central")]
pub mod btle;
pub mod nus;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Adapter error: {0}")]
    AdapterError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Characteristic {0} not found on peer")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}

//! BLE transport trait definitions and core types
//!
//! Defines the central-role interface that both the simulated transport
//! and the btleplug implementation conform to. Notifications are delivered
//! through an mpsc channel so all decoding happens on the consumer's task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl std::fmt::Display for BleAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleAddress::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

/// A peripheral seen during a scan window.
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    pub address: BleAddress,
    /// Advertised local name (if any).
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// An active BLE connection to a peripheral.
#[async_trait]
pub trait BleConnection: Send + Sync {
    /// Enable notifications on `characteristic` and return the channel
    /// they are delivered on. The channel closes when the link drops.
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    /// Ask the stack whether the link is still up.
    async fn is_connected(&self) -> bool;

    /// Disconnect from the peer.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Get the peer's BLE address.
    fn peer_address(&self) -> &BleAddress;
}

/// BLE central role: scanning for peripherals and connecting to them.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scan for `timeout` and return everything seen in that window.
    async fn scan(&self, timeout: std::time::Duration) -> Result<Vec<DiscoveredPeripheral>, BleError>;

    /// Connect to a previously discovered peripheral.
    async fn connect(&self, peripheral: &DiscoveredPeripheral) -> Result<Box<dyn BleConnection>, BleError>;
}

//! btleplug-backed BLE central (Mac/Linux/Windows)
//!
//! Uses the first Bluetooth adapter the platform reports. Notification
//! values arrive on btleplug's stream and are forwarded into an mpsc
//! channel by a small pump task, one per subscription.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::transport::{BleAddress, BleCentral, BleConnection, DiscoveredPeripheral};
use super::BleError;

fn adapter_err(e: btleplug::Error) -> BleError {
    BleError::AdapterError(e.to_string())
}

/// Central role over the host's first Bluetooth adapter.
pub struct BtleCentral {
    adapter: Adapter,
    /// Peripherals seen in the most recent scan, keyed by address.
    seen: Mutex<HashMap<BleAddress, Peripheral>>,
}

impl BtleCentral {
    /// Open the first adapter. Fails if the host has no Bluetooth adapter.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(adapter_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(adapter_err)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterError("no Bluetooth adapter found".to_string()))?;
        Ok(Self {
            adapter,
            seen: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredPeripheral>, BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("[ble] stop_scan failed: {}", e);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;

        let mut seen = self.seen.lock().await;
        seen.clear();
        let mut found = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("[ble] skipping peripheral without properties: {}", e);
                    continue;
                }
            };
            let address = BleAddress::Real(props.address.into_inner());
            found.push(DiscoveredPeripheral {
                address: address.clone(),
                name: props.local_name.clone(),
                services: props.services.clone(),
                rssi: props.rssi,
            });
            seen.insert(address, peripheral);
        }
        Ok(found)
    }

    async fn connect(&self, peripheral: &DiscoveredPeripheral) -> Result<Box<dyn BleConnection>, BleError> {
        let handle = {
            let seen = self.seen.lock().await;
            seen.get(&peripheral.address).cloned()
        };
        let handle = handle.ok_or_else(|| {
            BleError::ConnectionError(format!("{} not seen in last scan", peripheral.address))
        })?;

        handle
            .connect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        if let Err(e) = handle.discover_services().await {
            // No connection object reaches the caller, so nobody else would
            // tear this link down.
            if let Err(de) = handle.disconnect().await {
                log::debug!("[ble] disconnect after failed discovery: {}", de);
            }
            return Err(BleError::GattError(e.to_string()));
        }

        Ok(Box::new(BtleConnection {
            address: peripheral.address.clone(),
            peripheral: handle,
        }))
    }
}

/// Forward notifications for `characteristic` into `tx`. Ends when the
/// stream ends or as soon as the receiving side is dropped, even if the
/// peripheral has gone quiet.
async fn pump<S>(mut notifications: S, characteristic: Uuid, tx: mpsc::Sender<Vec<u8>>)
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    loop {
        let notification = tokio::select! {
            n = notifications.next() => match n {
                Some(n) => n,
                None => break,
            },
            _ = tx.closed() => break,
        };
        if notification.uuid != characteristic {
            continue;
        }
        if tx.send(notification.value).await.is_err() {
            break;
        }
    }
    log::debug!("[ble] notification pump for {} stopped", characteristic);
}

/// A live btleplug connection.
pub struct BtleConnection {
    address: BleAddress,
    peripheral: Peripheral,
}

#[async_trait]
impl BleConnection for BtleConnection {
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(BleError::CharacteristicNotFound(characteristic))?;

        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump(notifications, characteristic, tx));
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))
    }

    fn peer_address(&self) -> &BleAddress {
        &self.address
    }
}

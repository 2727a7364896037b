//! In-process BLE simulator
//!
//! Provides a simulated central and wearable peripherals that live entirely
//! in-process. Tests drive the peripheral side through a
//! [`SimPeripheralHandle`]: inject notification chunks, drop the link
//! (cleanly or silently), or make connection attempts fail.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::nus;
use super::transport::{BleAddress, BleCentral, BleConnection, DiscoveredPeripheral};
use super::BleError;

/// State shared between a peripheral, its handle and any live connection.
struct SimPeripheral {
    address: BleAddress,
    name: Option<String>,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    visible: AtomicBool,
    /// Remaining connection attempts that should fail.
    connect_failures: AtomicU32,
    session: Mutex<Option<SimSession>>,
    /// Count of successful notification subscriptions so far.
    subscriptions: watch::Sender<u32>,
}

struct SimSession {
    connected: Arc<AtomicBool>,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl SimPeripheral {
    fn end_session(&self, keep_channel: bool) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(s) = session.as_mut() {
                s.connected.store(false, Ordering::SeqCst);
                if !keep_channel {
                    s.notify_tx = None;
                }
            }
        }
    }
}

/// A simulated BLE central that "sees" every peripheral added to it.
pub struct SimBleCentral {
    peripherals: Mutex<Vec<Arc<SimPeripheral>>>,
    scans: AtomicU32,
}

impl SimBleCentral {
    /// Create a new simulated central with no peripherals in range.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peripherals: Mutex::new(Vec::new()),
            scans: AtomicU32::new(0),
        })
    }

    /// Add a NUS peripheral advertising `name` (if any) and the NUS service.
    pub fn add_wearable(&self, name: Option<&str>) -> SimPeripheralHandle {
        self.add_peripheral(name, vec![nus::UART_SERVICE_UUID], vec![nus::UART_TX_UUID])
    }

    /// Add an arbitrary peripheral.
    pub fn add_peripheral(
        &self,
        name: Option<&str>,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
    ) -> SimPeripheralHandle {
        let (subscriptions, _) = watch::channel(0);
        let peripheral = Arc::new(SimPeripheral {
            address: BleAddress::Simulated(Uuid::new_v4()),
            name: name.map(str::to_string),
            services,
            characteristics,
            visible: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            session: Mutex::new(None),
            subscriptions,
        });
        if let Ok(mut list) = self.peripherals.lock() {
            list.push(Arc::clone(&peripheral));
        }
        SimPeripheralHandle(peripheral)
    }

    /// Number of scans performed so far.
    pub fn scan_count(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for SimBleCentral {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<DiscoveredPeripheral>, BleError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let list = self
            .peripherals
            .lock()
            .map_err(|_| BleError::ScanError("simulated air poisoned".to_string()))?;
        Ok(list
            .iter()
            .filter(|p| p.visible.load(Ordering::SeqCst))
            .map(|p| DiscoveredPeripheral {
                address: p.address.clone(),
                name: p.name.clone(),
                services: p.services.clone(),
                rssi: Some(-50),
            })
            .collect())
    }

    async fn connect(&self, peripheral: &DiscoveredPeripheral) -> Result<Box<dyn BleConnection>, BleError> {
        let target = {
            let list = self
                .peripherals
                .lock()
                .map_err(|_| BleError::ConnectionError("simulated air poisoned".to_string()))?;
            list.iter().find(|p| p.address == peripheral.address).cloned()
        };
        let target = target.ok_or_else(|| {
            BleError::ConnectionError(format!("no peripheral at {}", peripheral.address))
        })?;

        let failed = target
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BleError::ConnectionError("simulated connect failure".to_string()));
        }

        // A new connection supersedes any previous session.
        target.end_session(false);
        let connected = Arc::new(AtomicBool::new(true));
        if let Ok(mut session) = target.session.lock() {
            *session = Some(SimSession {
                connected: Arc::clone(&connected),
                notify_tx: None,
            });
        }

        Ok(Box::new(SimBleConnection {
            address: target.address.clone(),
            peripheral: target,
            connected,
        }))
    }
}

/// The central's side of a simulated link.
pub struct SimBleConnection {
    address: BleAddress,
    peripheral: Arc<SimPeripheral>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl BleConnection for SimBleConnection {
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        if !self.peripheral.characteristics.contains(&characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        let (tx, rx) = mpsc::channel(64);
        {
            let mut session = self
                .peripheral
                .session
                .lock()
                .map_err(|_| BleError::GattError("session poisoned".to_string()))?;
            match session.as_mut() {
                Some(s) if Arc::ptr_eq(&s.connected, &self.connected) => s.notify_tx = Some(tx),
                _ => return Err(BleError::Disconnected),
            }
        }
        self.peripheral.subscriptions.send_modify(|n| *n += 1);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut session) = self.peripheral.session.lock() {
            if let Some(s) = session.as_mut() {
                if Arc::ptr_eq(&s.connected, &self.connected) {
                    s.notify_tx = None;
                }
            }
        }
        Ok(())
    }

    fn peer_address(&self) -> &BleAddress {
        &self.address
    }
}

/// Test-side control of a simulated wearable.
#[derive(Clone)]
pub struct SimPeripheralHandle(Arc<SimPeripheral>);

impl SimPeripheralHandle {
    /// Push one notification chunk to the subscribed central.
    /// Returns false if nobody is subscribed.
    pub async fn notify(&self, chunk: &[u8]) -> bool {
        let tx = match self.0.session.lock() {
            Ok(session) => session.as_ref().and_then(|s| s.notify_tx.clone()),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(chunk.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// Drop the link; the notification channel closes immediately.
    pub fn drop_link(&self) {
        self.0.end_session(false);
    }

    /// Drop the link without closing the notification channel, so only a
    /// liveness check can notice.
    pub fn drop_link_silently(&self) {
        self.0.end_session(true);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.0.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Show or hide this peripheral from scans.
    pub fn set_visible(&self, visible: bool) {
        self.0.visible.store(visible, Ordering::SeqCst);
    }

    /// Number of successful notification subscriptions so far.
    pub fn subscription_count(&self) -> u32 {
        *self.0.subscriptions.borrow()
    }

    /// Wait until at least `n` subscriptions have happened in total.
    pub async fn wait_for_subscriptions(&self, n: u32) {
        let mut rx = self.0.subscriptions.subscribe();
        while *rx.borrow_and_update() < n {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_connect_notify() {
        let central = SimBleCentral::new();
        let wearable = central.add_wearable(Some("ESP32-SaudeRemota"));

        let found = central.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("ESP32-SaudeRemota"));
        assert!(found[0].advertises(&nus::UART_SERVICE_UUID));

        let conn = central.connect(&found[0]).await.unwrap();
        let mut rx = conn.subscribe(nus::UART_TX_UUID).await.unwrap();
        assert_eq!(wearable.subscription_count(), 1);

        assert!(wearable.notify(b"hello").await);
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_drop_link_closes_channel() {
        let central = SimBleCentral::new();
        let wearable = central.add_wearable(None);
        let found = central.scan(Duration::from_secs(1)).await.unwrap();
        let conn = central.connect(&found[0]).await.unwrap();
        let mut rx = conn.subscribe(nus::UART_TX_UUID).await.unwrap();

        wearable.drop_link();
        assert!(rx.recv().await.is_none());
        assert!(!conn.is_connected().await);
        assert!(!wearable.notify(b"late").await);
    }

    #[tokio::test]
    async fn test_silent_drop_keeps_channel_open() {
        let central = SimBleCentral::new();
        let wearable = central.add_wearable(None);
        let found = central.scan(Duration::from_secs(1)).await.unwrap();
        let conn = central.connect(&found[0]).await.unwrap();
        let _rx = conn.subscribe(nus::UART_TX_UUID).await.unwrap();

        wearable.drop_link_silently();
        assert!(!conn.is_connected().await);
        assert!(wearable.notify(b"ghost").await);
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let central = SimBleCentral::new();
        let wearable = central.add_wearable(None);
        wearable.fail_next_connects(2);
        let found = central.scan(Duration::from_secs(1)).await.unwrap();

        assert!(central.connect(&found[0]).await.is_err());
        assert!(central.connect(&found[0]).await.is_err());
        assert!(central.connect(&found[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_characteristic() {
        let central = SimBleCentral::new();
        central.add_peripheral(Some("other"), vec![], vec![]);
        let found = central.scan(Duration::from_secs(1)).await.unwrap();
        let conn = central.connect(&found[0]).await.unwrap();
        assert!(matches!(
            conn.subscribe(nus::UART_TX_UUID).await,
            Err(BleError::CharacteristicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hidden_peripheral_not_scanned() {
        let central = SimBleCentral::new();
        let wearable = central.add_wearable(Some("w"));
        wearable.set_visible(false);
        assert!(central.scan(Duration::from_secs(1)).await.unwrap().is_empty());
        assert_eq!(central.scan_count(), 1);
    }
}

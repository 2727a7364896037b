//! Nordic UART Service identifiers
//!
//! The wearable advertises NUS and streams newline-delimited JSON through
//! notifications on the TX characteristic.

use uuid::Uuid;

/// NUS primary service, advertised by the wearable.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Central → peripheral (write).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Peripheral → central (notify). This is the characteristic the bridge subscribes to.
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_match_textual_form() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(UART_TX_UUID.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
        assert_ne!(UART_RX_UUID, UART_TX_UUID);
    }
}

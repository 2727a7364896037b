//! Bridge configuration
//!
//! Plain structs with defaults for every component, plus the clap-derived
//! [`BridgeArgs`] that the binary parses from flags and environment.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use uuid::Uuid;

use crate::ble::nus;
use crate::framing::DEFAULT_MAX_LINE;

pub const DEFAULT_DEVICE_NAME: &str = "ESP32-SaudeRemota";
pub const DEFAULT_AUTH_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Radio link settings.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Advertised local name to look for first.
    pub device_name: String,
    /// Advertised service to fall back to when no name matches.
    pub service_uuid: Uuid,
    /// Characteristic whose notifications carry the stream.
    pub notify_uuid: Uuid,
    pub scan_timeout: Duration,
    /// Wait before scanning again when the device was not seen.
    pub rescan_delay: Duration,
    /// Wait before scanning again after an error.
    pub reconnect_delay: Duration,
    /// How often the link is asked whether it is still up.
    pub liveness_interval: Duration,
    pub max_line: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            service_uuid: nus::UART_SERVICE_UUID,
            notify_uuid: nus::UART_TX_UUID,
            scan_timeout: Duration::from_secs(8),
            rescan_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(3),
            liveness_interval: Duration::from_secs(1),
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

/// Live fan-out settings.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Longest a single subscriber may take to accept a message.
    pub send_timeout: Duration,
    /// Messages buffered per subscriber connection.
    pub outbox_depth: usize,
    /// Records buffered between decoding and publication.
    pub fanout_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            outbox_depth: 64,
            fanout_depth: 256,
        }
    }
}

/// Forward queue settings.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(30),
        }
    }
}

/// Remote database credentials and endpoints.
#[derive(Clone)]
pub struct UploaderConfig {
    pub email: String,
    pub password: String,
    pub api_key: String,
    /// Database root, e.g. `https://project-default-rtdb.europe-west1.firebasedatabase.app`.
    pub database_url: String,
    pub auth_endpoint: String,
    /// Collection records are written under.
    pub collection: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            api_key: String::new(),
            database_url: String::new(),
            auth_endpoint: DEFAULT_AUTH_ENDPOINT.to_string(),
            collection: "raw".to_string(),
            request_timeout: Duration::from_secs(10),
            user_agent: concat!("vitals-bridge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl std::fmt::Debug for UploaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploaderConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("database_url", &self.database_url)
            .field("auth_endpoint", &self.auth_endpoint)
            .field("collection", &self.collection)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl UploaderConfig {
    /// Credentials must all be present before the bridge starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.is_empty() {
            return Err(ConfigError::Missing("remote store email"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("remote store password"));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::Missing("remote store API key"));
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::Missing("remote store database URL"));
        }
        if !self.database_url.starts_with("http://") && !self.database_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "database URL",
                reason: format!("{} is not an http(s) URL", self.database_url),
            });
        }
        Ok(())
    }
}

/// Audit log location.
#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub dir: PathBuf,
    pub jsonl_name: String,
    pub csv_name: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            jsonl_name: "raw_log.jsonl".to_string(),
            csv_name: "raw_log.csv".to_string(),
        }
    }
}

impl AuditConfig {
    pub fn jsonl_path(&self) -> PathBuf {
        self.dir.join(&self.jsonl_name)
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(&self.csv_name)
    }
}

/// Everything the bridge needs to start.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub http_addr: SocketAddr,
    pub link: LinkConfig,
    pub hub: HubConfig,
    pub queue: QueueConfig,
    pub uploader: UploaderConfig,
    pub audit: AuditConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            link: LinkConfig::default(),
            hub: HubConfig::default(),
            queue: QueueConfig::default(),
            uploader: UploaderConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// Command-line and environment settings for the bridge binary.
#[derive(Parser, Debug)]
#[command(name = "vitals_bridge", about = "BLE wearable bridge: live WebSocket view, audit log and remote upload")]
pub struct BridgeArgs {
    /// BLE advertised device name
    #[arg(long, env = "BRIDGE_DEVICE_NAME", default_value = DEFAULT_DEVICE_NAME)]
    pub device_name: String,

    /// Interface to serve HTTP/WebSocket on
    #[arg(long, env = "BRIDGE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "BRIDGE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Seconds per BLE scan window
    #[arg(long, env = "BRIDGE_SCAN_TIMEOUT", default_value_t = 8.0)]
    pub scan_timeout: f64,

    /// Directory for the JSONL and CSV audit logs
    #[arg(long, env = "BRIDGE_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Forward queue capacity
    #[arg(long, env = "BRIDGE_QUEUE_CAPACITY", default_value_t = 1000)]
    pub queue_capacity: usize,

    #[arg(long, env = "FIREBASE_EMAIL")]
    pub email: Option<String>,

    #[arg(long, env = "FIREBASE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "FIREBASE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "FIREBASE_DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "FIREBASE_AUTH_ENDPOINT", default_value = DEFAULT_AUTH_ENDPOINT)]
    pub auth_endpoint: String,
}

impl BridgeArgs {
    /// Validate and convert into a [`BridgeConfig`].
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            name: "host",
            reason: format!("{}: {}", self.host, e),
        })?;
        let http_addr = SocketAddr::new(ip, self.port);
        if !(self.scan_timeout.is_finite() && self.scan_timeout > 0.0) {
            return Err(ConfigError::Invalid {
                name: "scan timeout",
                reason: format!("{} is not a positive number of seconds", self.scan_timeout),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "queue capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        let uploader = UploaderConfig {
            email: self.email.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            api_key: self.api_key.unwrap_or_default(),
            database_url: self.database_url.unwrap_or_default(),
            auth_endpoint: self.auth_endpoint,
            ..UploaderConfig::default()
        };
        uploader.validate()?;

        Ok(BridgeConfig {
            http_addr,
            link: LinkConfig {
                device_name: self.device_name,
                scan_timeout: Duration::from_secs_f64(self.scan_timeout),
                ..LinkConfig::default()
            },
            hub: HubConfig::default(),
            queue: QueueConfig {
                capacity: self.queue_capacity,
                ..QueueConfig::default()
            },
            uploader,
            audit: AuditConfig {
                dir: self.log_dir,
                ..AuditConfig::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn args(extra: &[&str]) -> BridgeArgs {
        let mut argv = vec!["vitals_bridge"];
        argv.extend_from_slice(extra);
        BridgeArgs::try_parse_from(argv).unwrap()
    }

    const CREDS: &[&str] = &[
        "--email",
        "a@b.c",
        "--password",
        "pw",
        "--api-key",
        "key",
        "--database-url",
        "https://example-rtdb.firebaseio.com",
    ];

    #[test]
    fn test_defaults_with_credentials() {
        let config = args(CREDS).into_config().unwrap();
        assert_eq!(config.http_addr, SocketAddr::from(([127, 0, 0, 1], 8000)));
        assert_eq!(config.link.device_name, DEFAULT_DEVICE_NAME);
        assert_eq!(config.link.scan_timeout, Duration::from_secs(8));
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.backoff_ceiling, Duration::from_secs(30));
        assert_eq!(config.uploader.collection, "raw");
        assert_eq!(config.audit.csv_path(), PathBuf::from("logs/raw_log.csv"));
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        let result = args(&["--email", "a@b.c"]).into_config();
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_bad_database_url() {
        let mut argv = CREDS.to_vec();
        let last = argv.len() - 1;
        argv[last] = "example-rtdb.firebaseio.com";
        let result = args(&argv).into_config();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_overrides() {
        let mut argv = CREDS.to_vec();
        argv.extend_from_slice(&[
            "--device-name",
            "Wrist-01",
            "--port",
            "9001",
            "--scan-timeout",
            "2.5",
            "--queue-capacity",
            "5",
        ]);
        let config = args(&argv).into_config().unwrap();
        assert_eq!(config.link.device_name, "Wrist-01");
        assert_eq!(config.http_addr.port(), 9001);
        assert_eq!(config.link.scan_timeout, Duration::from_millis(2500));
        assert_eq!(config.queue.capacity, 5);
    }

    #[test]
    fn test_ipv6_host() {
        let mut argv = CREDS.to_vec();
        argv.extend_from_slice(&["--host", "::1", "--port", "8001"]);
        let config = args(&argv).into_config().unwrap();
        assert_eq!(config.http_addr, SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8001));

        let mut argv = CREDS.to_vec();
        argv.extend_from_slice(&["--host", "[::]"]);
        assert!(args(&argv).into_config().unwrap().http_addr.is_ipv6());

        let mut argv = CREDS.to_vec();
        argv.extend_from_slice(&["--host", "not-an-ip"]);
        assert!(matches!(
            args(&argv).into_config(),
            Err(ConfigError::Invalid { name: "host", .. })
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut argv = CREDS.to_vec();
        argv.extend_from_slice(&["--queue-capacity", "0"]);
        assert!(args(&argv).into_config().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = args(CREDS).into_config().unwrap();
        let text = format!("{:?}", config.uploader);
        assert!(!text.contains("pw\""));
        assert!(text.contains("<redacted>"));
    }
}

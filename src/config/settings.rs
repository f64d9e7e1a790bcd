use serde::Deserialize;

use crate::packet::MAX_REMAINING_LENGTH;

/// Top-level configuration settings for the broker process.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub log: LogSettings,
}

/// Where the TCP listener binds, and how long a new socket may take to
/// send its CONNECT.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

/// Engine limits and redelivery policy.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub allow_anonymous: bool,
    /// How often unacknowledged deliveries are checked.
    pub retry_interval_secs: u64,
    /// Age after which an unacknowledged delivery is re-sent.
    pub ack_timeout_secs: u64,
    pub max_retries: u8,
    pub max_packet_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub allow_anonymous: Option<bool>,
    pub retry_interval_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub max_retries: Option<u8>,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1883,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            allow_anonymous: true,
            retry_interval_secs: 5,
            ack_timeout_secs: 10,
            max_retries: 5,
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            path: "mqttd_db".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server;
        let broker = self.broker;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                connect_timeout_secs: server
                    .as_ref()
                    .and_then(|s| s.connect_timeout_secs)
                    .unwrap_or(default.server.connect_timeout_secs),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .as_ref()
                    .and_then(|b| b.max_connections)
                    .unwrap_or(default.broker.max_connections),
                allow_anonymous: broker
                    .as_ref()
                    .and_then(|b| b.allow_anonymous)
                    .unwrap_or(default.broker.allow_anonymous),
                retry_interval_secs: broker
                    .as_ref()
                    .and_then(|b| b.retry_interval_secs)
                    .unwrap_or(default.broker.retry_interval_secs),
                ack_timeout_secs: broker
                    .as_ref()
                    .and_then(|b| b.ack_timeout_secs)
                    .unwrap_or(default.broker.ack_timeout_secs),
                max_retries: broker
                    .as_ref()
                    .and_then(|b| b.max_retries)
                    .unwrap_or(default.broker.max_retries),
                max_packet_size: broker
                    .as_ref()
                    .and_then(|b| b.max_packet_size)
                    .unwrap_or(default.broker.max_packet_size),
            },
            persistence: PersistenceSettings {
                path: self
                    .persistence
                    .and_then(|p| p.path)
                    .unwrap_or(default.persistence.path),
            },
            log: LogSettings {
                level: self
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}

use crate::certstore::CertStoreConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub coordinator: CoordinatorConfig,
    pub network: NetworkConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub id: String,
    /// Create topics on first produce, the way a development cluster would.
    pub auto_create_topics: bool,
    /// Partition count used for auto-created topics and `create_topic`.
    pub default_partitions: u32,
    /// In-memory log segments roll once they grow past this many bytes.
    pub segment_bytes: u64,
    /// Produces with a serialized record larger than this are rejected.
    pub max_message_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: format!("broker-{}", uuid::Uuid::new_v4()),
            auto_create_topics: true,
            default_partitions: 1,
            segment_bytes: 1024 * 1024, // 1MB
            max_message_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address the coordination service listens on. Port 0 binds an ephemeral port.
    pub listen: String,
    /// Endpoints brokers use to reach the coordinator. Filled in by the harness
    /// once the listener is bound when an ephemeral port is in play.
    pub endpoints: Vec<String>,
    /// Broker sessions with no heartbeat for this long are expired.
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            endpoints: Vec::new(),
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the broker's QUIC endpoint listens on. Port 0 binds an ephemeral port.
    pub listen: String,
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 1000,
            connection_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Certificate store backing the broker's listener and verified clients.
    /// Required when `enabled` is true.
    pub cert_store: Option<CertStoreConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::BrokerUnitError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.broker.id.is_empty() {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "broker.id cannot be empty".to_string(),
            ));
        }

        if self.broker.default_partitions == 0 {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "broker.default_partitions must be greater than 0".to_string(),
            ));
        }

        if self.broker.segment_bytes == 0 {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "broker.segment_bytes must be greater than 0".to_string(),
            ));
        }

        if self.broker.max_message_bytes == 0 {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "broker.max_message_bytes must be greater than 0".to_string(),
            ));
        }

        if self.coordinator.session_timeout_ms == 0 {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "coordinator.session_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.coordinator.heartbeat_interval_ms >= self.coordinator.session_timeout_ms {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "coordinator.heartbeat_interval_ms must be below session_timeout_ms".to_string(),
            ));
        }

        if self.tls.enabled && self.tls.cert_store.is_none() {
            return Err(crate::error::BrokerUnitError::InvalidConfig(
                "tls.cert_store is required when tls.enabled is true".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply a string-keyed broker override, the shape producer/consumer test
    /// code expects from a broker properties bag.
    pub fn apply_override(&mut self, key: &str, value: &str) -> crate::Result<()> {
        match key {
            "log.segment.bytes" => {
                self.broker.segment_bytes = parse_override(key, value)?;
            }
            "message.max.bytes" => {
                self.broker.max_message_bytes = parse_override(key, value)?;
            }
            "num.partitions" => {
                self.broker.default_partitions = parse_override(key, value)?;
            }
            "auto.create.topics.enable" => {
                self.broker.auto_create_topics = parse_override(key, value)?;
            }
            _ => {
                return Err(crate::error::BrokerUnitError::InvalidConfig(format!(
                    "unknown broker config key: {key}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.parse().map_err(|_| {
        crate::error::BrokerUnitError::InvalidConfig(format!(
            "invalid value {value:?} for broker config key {key}"
        ))
    })
}

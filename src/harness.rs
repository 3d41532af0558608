//! The embedded harness: one coordinator plus one broker, lifecycle-managed,
//! for exercising producer/consumer code without a live cluster.

use crate::broker::{Broker, BrokerState};
use crate::certstore::{generate_cert_store, CertStoreConfig};
use crate::client::{BrokerClient, ClientConfig};
use crate::config::{BrokerConfig, Config};
use crate::coordinator::Coordinator;
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use tempfile::TempDir;
use tokio::time::{Duration, Instant};
use tracing::info;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An embedded broker plus its coordination service.
///
/// ```no_run
/// # use brokerunit::{BrokerUnit, ProduceRecord};
/// # async fn example() -> brokerunit::Result<()> {
/// let mut unit = BrokerUnit::ephemeral();
/// unit.startup().await?;
/// unit.create_topic("orders").await?;
/// unit.send_message(ProduceRecord::new("orders", "key", "value")).await?;
/// let messages = unit.read_messages("orders", 1).await?;
/// assert_eq!(messages[0].value_str(), Some("value"));
/// unit.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct BrokerUnit {
    config: Config,
    overrides: Vec<(String, String)>,
    read_timeout: Duration,
    // Keeps auto-generated certificates on disk for the harness lifetime.
    generated_store: Option<TempDir>,
    coordinator: Option<Coordinator>,
    broker: Option<Broker>,
    client: Option<BrokerClient>,
}

impl BrokerUnit {
    /// Harness on explicit localhost ports.
    pub fn new(coordinator_port: u16, broker_port: u16) -> Self {
        let mut config = Config::default();
        config.coordinator.listen = format!("127.0.0.1:{coordinator_port}");
        config.network.listen = format!("127.0.0.1:{broker_port}");
        Self::from_config(config)
    }

    /// Harness on OS-assigned ports; the actual ports are available from the
    /// connection strings after `startup`.
    pub fn ephemeral() -> Self {
        Self::new(0, 0)
    }

    /// TLS harness with a certificate store generated on the fly.
    pub fn with_tls(coordinator_port: u16, broker_port: u16) -> Result<Self> {
        let dir = TempDir::new()?;
        let store = generate_cert_store(dir.path())?;
        let mut unit = Self::with_tls_cert_store(coordinator_port, broker_port, store);
        unit.generated_store = Some(dir);
        Ok(unit)
    }

    /// TLS harness backed by caller-provided certificates.
    pub fn with_tls_cert_store(
        coordinator_port: u16,
        broker_port: u16,
        store: CertStoreConfig,
    ) -> Self {
        let mut unit = Self::new(coordinator_port, broker_port);
        unit.config.tls.enabled = true;
        unit.config.tls.cert_store = Some(store);
        unit
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            overrides: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            generated_store: None,
            coordinator: None,
            broker: None,
            client: None,
        }
    }

    /// Stash a string-keyed broker override, applied at startup. Unknown keys
    /// and unparseable values fail `startup`.
    pub fn set_broker_config(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.overrides.push((key.into(), value.into()));
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Bring the harness up: coordinator first, then the broker (which
    /// registers against it), then the harness's own client connection.
    pub async fn startup(&mut self) -> Result<()> {
        if self.broker.is_some() {
            return Err(BrokerUnitError::InvalidOperation(
                "harness already started".to_string(),
            ));
        }

        for (key, value) in &self.overrides {
            self.config.apply_override(key, value)?;
        }

        let mut coordinator = Coordinator::start(self.config.coordinator.clone()).await?;
        self.config.coordinator.endpoints = vec![coordinator.connect_string()];

        let mut broker = Broker::from_config(self.config.clone())?;
        if let Err(e) = broker.start().await {
            // Do not leave a half-started harness behind.
            let _ = coordinator.stop().await;
            return Err(e);
        }

        let client_config = match &self.config.tls.cert_store {
            Some(store) if self.config.tls.enabled => {
                ClientConfig::with_cert_store(broker.connect_string(), store.clone())
            }
            _ => ClientConfig::insecure(broker.connect_string()),
        };
        let client = match BrokerClient::connect(client_config).await {
            Ok(client) => client,
            Err(e) => {
                let _ = broker.stop().await;
                let _ = coordinator.stop().await;
                return Err(e);
            }
        };

        info!(
            broker = %broker.connect_string(),
            coordinator = %coordinator.connect_string(),
            "Harness started"
        );

        self.coordinator = Some(coordinator);
        self.broker = Some(broker);
        self.client = Some(client);
        Ok(())
    }

    /// Tear the harness down in reverse order: client, broker, coordinator.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close();
        }

        let mut first_error = None;
        if let Some(mut broker) = self.broker.take() {
            if broker.state().await == BrokerState::Running {
                if let Err(e) = broker.stop().await {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(mut coordinator) = self.coordinator.take() {
            if let Err(e) = coordinator.stop().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                info!("Harness shut down");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    pub async fn create_topic(&self, name: &str) -> Result<()> {
        let partitions = self.config.broker.default_partitions;
        self.create_topic_with_partitions(name, partitions).await
    }

    pub async fn create_topic_with_partitions(&self, name: &str, partitions: u32) -> Result<()> {
        self.client()?.create_topic(name, partitions).await
    }

    pub async fn send_message(&self, record: ProduceRecord) -> Result<Offset> {
        self.client()?.produce_record(record).await
    }

    pub async fn send_messages(&self, records: Vec<ProduceRecord>) -> Result<Vec<Offset>> {
        let client = self.client()?;
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(client.produce_record(record).await?);
        }
        Ok(offsets)
    }

    /// Read from offset 0 until at least `expected` messages have arrived, or
    /// fail with a read-timeout error naming how many showed up.
    pub async fn read_messages(&self, topic: &str, expected: usize) -> Result<Vec<ConsumedRecord>> {
        self.read_messages_with_timeout(topic, expected, self.read_timeout)
            .await
    }

    pub async fn read_messages_with_timeout(
        &self,
        topic: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>> {
        let client = self.client()?;
        let deadline = Instant::now() + timeout;

        loop {
            let collected = self.collect_messages(client, topic).await?;
            if collected.len() >= expected {
                return Ok(collected);
            }
            if Instant::now() >= deadline {
                return Err(BrokerUnitError::ReadTimeout {
                    topic: topic.to_string(),
                    expected,
                    received: collected.len(),
                });
            }
            tokio::time::sleep(READ_POLL_INTERVAL).await;
        }
    }

    async fn collect_messages(
        &self,
        client: &BrokerClient,
        topic: &str,
    ) -> Result<Vec<ConsumedRecord>> {
        let metadata = client.metadata(vec![topic.to_string()]).await?;
        let Some(info) = metadata.topics.into_iter().find(|t| t.name == topic) else {
            // Auto-created topics race with the first read; absent means
            // "no records yet", not an error.
            return Ok(Vec::new());
        };

        let mut collected = Vec::new();
        for partition in 0..info.partitions {
            let response = match client.fetch(topic, partition, 0, u32::MAX).await {
                Ok(response) => response,
                Err(BrokerUnitError::TopicNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for stored in response.records {
                collected.push(ConsumedRecord {
                    topic: topic.to_string(),
                    partition,
                    offset: stored.offset,
                    key: stored.record.key,
                    value: stored.record.value,
                    headers: stored.record.headers,
                    timestamp: stored.record.timestamp,
                });
            }
        }
        collected.sort_by_key(|r| (r.partition, r.offset));
        Ok(collected)
    }

    /// Connection string for the broker, for wiring external clients.
    pub fn broker_connect(&self) -> Result<String> {
        Ok(self.running_broker()?.connect_string())
    }

    /// Connection string for the coordination service.
    pub fn coordinator_connect(&self) -> Result<String> {
        self.coordinator
            .as_ref()
            .map(|c| c.connect_string())
            .ok_or_else(not_started)
    }

    /// Effective broker configuration after overrides, as the running broker
    /// sees it.
    pub fn broker_config(&self) -> Result<&BrokerConfig> {
        Ok(&self.running_broker()?.config().broker)
    }

    /// The running broker, for assertions that reach into its state.
    pub fn broker(&self) -> Result<&Broker> {
        self.running_broker()
    }

    /// The certificate store backing TLS mode, for wiring external clients.
    pub fn cert_store(&self) -> Option<&CertStoreConfig> {
        self.config.tls.cert_store.as_ref()
    }

    fn client(&self) -> Result<&BrokerClient> {
        self.client.as_ref().ok_or_else(not_started)
    }

    fn running_broker(&self) -> Result<&Broker> {
        self.broker.as_ref().ok_or_else(not_started)
    }
}

fn not_started() -> BrokerUnitError {
    BrokerUnitError::InvalidOperation("harness not started".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_startup_and_shutdown() {
        let mut unit = BrokerUnit::ephemeral();
        unit.startup().await.unwrap();

        let connect = unit.broker_connect().unwrap();
        assert!(connect.starts_with("127.0.0.1:"));
        assert!(!connect.ends_with(":0"));
        assert!(unit.coordinator_connect().is_ok());

        unit.shutdown().await.unwrap();
        assert!(unit.broker_connect().is_err());
    }

    #[tokio::test]
    async fn test_double_startup_rejected() {
        let mut unit = BrokerUnit::ephemeral();
        unit.startup().await.unwrap();
        assert!(unit.startup().await.is_err());
        unit.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_override_fails_startup() {
        let mut unit = BrokerUnit::ephemeral();
        unit.set_broker_config("no.such.key", "1");
        let result = unit.startup().await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown broker config key"));
    }

    #[tokio::test]
    async fn test_operations_before_startup_fail() {
        let unit = BrokerUnit::ephemeral();
        assert!(unit.create_topic("orders").await.is_err());
        assert!(unit
            .send_message(ProduceRecord::new("orders", "k", "v"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut unit = BrokerUnit::ephemeral();
        unit.startup().await.unwrap();
        unit.shutdown().await.unwrap();
        unit.shutdown().await.unwrap();
    }
}

//! Broker lifecycle: component wiring, the state machine, startup and shutdown
//! ordering, and registration against the coordination service.

use crate::broker::core::BrokerCore;
use crate::broker::server::{
    CreateTopicHandler, FetchHandler, MetadataHandler, ProduceHandler, QuicServer, RequestRouter,
};
use crate::config::Config;
use crate::coordinator::CoordinatorClient;
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

const COORDINATOR_CONNECT_ATTEMPTS: usize = 5;
const COORDINATOR_CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Broker lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// The embedded broker: QUIC data plane in front of in-memory partition logs,
/// registered with and heartbeating against the coordination service.
pub struct Broker {
    config: Config,
    state: Arc<AsyncRwLock<BrokerState>>,
    core: Arc<BrokerCore>,
    info: BrokerInfo,
    local_addr: SocketAddr,
    quic_server: Option<QuicServer>,
    endpoint: quinn::Endpoint,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Create a broker from configuration. The QUIC endpoint is bound here, so
    /// the actual listen address is known before `start()`; nothing is served
    /// and nothing is registered until then.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        if config.coordinator.endpoints.is_empty() {
            return Err(BrokerUnitError::InvalidConfig(
                "coordinator.endpoints cannot be empty".to_string(),
            ));
        }

        let core = Arc::new(BrokerCore::new(config.broker.clone()));

        // Bind first so the advertised address reflects an ephemeral port.
        let placeholder = BrokerInfo {
            id: config.broker.id.clone(),
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let handler = Arc::new(BrokerHandler {
            core: core.clone(),
            info: parking_lot::RwLock::new(placeholder),
            coordinator_endpoint: config.coordinator.endpoints[0].clone(),
        });
        let router = RequestRouter::new(
            handler.clone(),
            handler.clone(),
            handler.clone(),
            handler.clone(),
        );
        let quic_server = QuicServer::new(&config.network, &config.tls, router)?;
        let local_addr = quic_server.local_addr();
        let endpoint = quic_server.endpoint();

        let info = BrokerInfo {
            id: config.broker.id.clone(),
            host: "127.0.0.1".to_string(),
            port: local_addr.port(),
        };
        handler.set_info(info.clone());

        info!(
            broker_id = %info.id,
            listen = %local_addr,
            tls = config.tls.enabled,
            "Broker created"
        );

        Ok(Self {
            config,
            state: Arc::new(AsyncRwLock::new(BrokerState::Created)),
            core,
            info,
            local_addr,
            quic_server: Some(quic_server),
            endpoint,
            background_tasks: Vec::new(),
        })
    }

    /// Start serving and register with the coordinator. Fails if the
    /// coordination service cannot be reached, as the real broker would.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != BrokerState::Created {
                return Err(BrokerUnitError::InvalidOperation(format!(
                    "Cannot start broker in state {:?}",
                    *state
                )));
            }
            *state = BrokerState::Starting;
        }

        let mut coordinator = self.connect_coordinator().await?;
        coordinator.register_broker(self.info.clone()).await?;

        let quic_server = self.quic_server.take().ok_or_else(|| {
            BrokerUnitError::InvalidOperation("QUIC server already started".to_string())
        })?;
        let serve_task = tokio::spawn(async move {
            if let Err(e) = quic_server.serve().await {
                warn!("QUIC server error: {e}");
            }
        });
        self.background_tasks.push(serve_task);

        let broker_id = self.info.id.clone();
        let heartbeat_interval = Duration::from_millis(self.config.coordinator.heartbeat_interval_ms);
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                if let Err(e) = coordinator.heartbeat(&broker_id).await {
                    warn!(%broker_id, "Coordinator heartbeat failed: {e}");
                    break;
                }
            }
        });
        self.background_tasks.push(heartbeat_task);

        {
            let mut state = self.state.write().await;
            *state = BrokerState::Running;
        }
        info!(broker_id = %self.info.id, "Broker running on {}", self.connect_string());
        Ok(())
    }

    /// Stop the broker: deregister, close the endpoint, drop background tasks.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != BrokerState::Running {
                return Err(BrokerUnitError::InvalidOperation(format!(
                    "Cannot stop broker in state {:?}",
                    *state
                )));
            }
            *state = BrokerState::Stopping;
        }

        info!(broker_id = %self.info.id, "Stopping broker");

        // Best effort: the coordinator expires the session anyway.
        match self.connect_coordinator().await {
            Ok(mut coordinator) => {
                if let Err(e) = coordinator.deregister_broker(&self.info.id).await {
                    warn!("Failed to deregister broker: {e}");
                }
            }
            Err(e) => warn!("Coordinator unreachable during shutdown: {e}"),
        }

        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;

        // Await cancellation so task-held endpoint clones are dropped and the
        // UDP socket is released before stop() returns.
        for task in self.background_tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        {
            let mut state = self.state.write().await;
            *state = BrokerState::Stopped;
        }
        info!(broker_id = %self.info.id, "Broker stopped");
        Ok(())
    }

    async fn connect_coordinator(&self) -> Result<CoordinatorClient> {
        let endpoint = &self.config.coordinator.endpoints[0];
        let mut last_error = None;
        for _ in 0..COORDINATOR_CONNECT_ATTEMPTS {
            match CoordinatorClient::connect(endpoint).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = Some(e);
                    tokio::time::sleep(COORDINATOR_CONNECT_BACKOFF).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            BrokerUnitError::Coordinator("coordinator unreachable".to_string())
        }))
    }

    pub async fn state(&self) -> BrokerState {
        self.state.read().await.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn core(&self) -> Arc<BrokerCore> {
        self.core.clone()
    }

    pub fn info(&self) -> &BrokerInfo {
        &self.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connect_string(&self) -> String {
        self.info.connect_string()
    }
}

/// Request handlers backing the QUIC router: translate wire requests into core
/// operations and error codes, and push topic registrations to the coordinator.
struct BrokerHandler {
    core: Arc<BrokerCore>,
    info: parking_lot::RwLock<BrokerInfo>,
    coordinator_endpoint: String,
}

impl BrokerHandler {
    fn set_info(&self, info: BrokerInfo) {
        // Called once during from_config, before any request can arrive.
        *self.info.write() = info;
    }

    async fn register_topic(&self, topic: TopicInfo) {
        let result = async {
            let mut client = CoordinatorClient::connect(&self.coordinator_endpoint).await?;
            client.create_topic(topic.clone()).await
        }
        .await;
        if let Err(e) = result {
            warn!(topic = %topic.name, "Failed to register topic with coordinator: {e}");
        }
    }
}

fn code_for(error: &BrokerUnitError) -> u32 {
    match error {
        BrokerUnitError::TopicNotFound(_) => error_code::TOPIC_NOT_FOUND,
        BrokerUnitError::TopicAlreadyExists(_) => error_code::TOPIC_ALREADY_EXISTS,
        BrokerUnitError::PartitionNotFound(_) => error_code::PARTITION_NOT_FOUND,
        BrokerUnitError::MessageTooLarge { .. } => error_code::MESSAGE_TOO_LARGE,
        _ => error_code::UNKNOWN,
    }
}

#[async_trait]
impl ProduceHandler for BrokerHandler {
    async fn handle_produce(&self, request: ProduceRequest) -> Result<ProduceResponse> {
        match self
            .core
            .produce(&request.topic, request.partition, request.records)
        {
            Ok(outcome) => {
                if let Some(topic) = outcome.auto_created {
                    self.register_topic(topic).await;
                }
                Ok(ProduceResponse {
                    base_offset: outcome.base_offset,
                    error_code: error_code::NONE,
                    error_message: None,
                })
            }
            Err(e) => Ok(ProduceResponse {
                base_offset: 0,
                error_code: code_for(&e),
                error_message: Some(e.to_string()),
            }),
        }
    }
}

#[async_trait]
impl FetchHandler for BrokerHandler {
    async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        match self.core.fetch(
            &request.topic,
            request.partition,
            request.fetch_offset,
            request.max_records as usize,
        ) {
            Ok((records, high_watermark)) => Ok(FetchResponse {
                records,
                high_watermark,
                error_code: error_code::NONE,
                error_message: None,
            }),
            Err(e) => Ok(FetchResponse {
                records: vec![],
                high_watermark: 0,
                error_code: code_for(&e),
                error_message: Some(e.to_string()),
            }),
        }
    }
}

#[async_trait]
impl MetadataHandler for BrokerHandler {
    async fn handle_metadata(&self, request: MetadataRequest) -> Result<MetadataResponse> {
        let topics = if request.topics.is_empty() {
            self.core.topics()
        } else {
            request
                .topics
                .iter()
                .filter_map(|name| self.core.topic(name))
                .collect()
        };
        Ok(MetadataResponse {
            broker: self.info.read().clone(),
            topics,
        })
    }
}

#[async_trait]
impl CreateTopicHandler for BrokerHandler {
    async fn handle_create_topic(&self, request: CreateTopicRequest) -> Result<CreateTopicResponse> {
        match self.core.create_topic(&request.name, request.partitions) {
            Ok(info) => {
                self.register_topic(info).await;
                Ok(CreateTopicResponse {
                    error_code: error_code::NONE,
                    error_message: None,
                })
            }
            Err(e) => Ok(CreateTopicResponse {
                error_code: code_for(&e),
                error_message: Some(e.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::Coordinator;

    async fn started_coordinator() -> Coordinator {
        Coordinator::start(CoordinatorConfig::default())
            .await
            .unwrap()
    }

    fn broker_config(coordinator_endpoint: String) -> Config {
        let mut config = Config::default();
        config.coordinator.endpoints = vec![coordinator_endpoint];
        config
    }

    #[tokio::test]
    async fn test_lifecycle_state_transitions() {
        let mut coordinator = started_coordinator().await;
        let config = broker_config(coordinator.connect_string());

        let mut broker = Broker::from_config(config).unwrap();
        assert_eq!(broker.state().await, BrokerState::Created);

        broker.start().await.unwrap();
        assert_eq!(broker.state().await, BrokerState::Running);
        assert!(broker.connect_string().starts_with("127.0.0.1:"));

        // Registration is visible to the coordinator.
        let brokers = coordinator.registry().live_brokers().await;
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].port, broker.local_addr().port());

        broker.stop().await.unwrap();
        assert_eq!(broker.state().await, BrokerState::Stopped);
        assert!(coordinator.registry().live_brokers().await.is_empty());

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut coordinator = started_coordinator().await;
        let config = broker_config(coordinator.connect_string());

        let mut broker = Broker::from_config(config).unwrap();
        broker.start().await.unwrap();
        assert!(broker.start().await.is_err());

        broker.stop().await.unwrap();
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_coordinator_fails() {
        // Nothing listens on this endpoint.
        let config = broker_config("127.0.0.1:1".to_string());
        let mut broker = Broker::from_config(config).unwrap();
        assert!(broker.start().await.is_err());
    }

    #[test]
    fn test_missing_coordinator_endpoint_is_config_error() {
        let config = Config::default();
        assert!(Broker::from_config(config).is_err());
    }
}

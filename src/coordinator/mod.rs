//! The coordination service the broker depends on, in the role ZooKeeper plays
//! for a real cluster: broker registration with session expiry, heartbeats, and
//! the topic registry. Speaks a length-prefixed bincode protocol over TCP.

use crate::config::CoordinatorConfig;
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    RegisterBroker(BrokerInfo),
    Heartbeat { broker_id: BrokerId },
    DeregisterBroker { broker_id: BrokerId },
    CreateTopic(TopicInfo),
    GetTopic { name: TopicName },
    ListTopics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    Registered { session_id: SessionId },
    HeartbeatAck,
    Deregistered,
    TopicCreated,
    Topic(Option<TopicInfo>),
    Topics(Vec<TopicInfo>),
    Error(String),
}

struct BrokerSession {
    info: BrokerInfo,
    session_id: SessionId,
    last_heartbeat: Instant,
}

/// Cluster metadata held by the coordinator.
pub struct Registry {
    brokers: AsyncRwLock<HashMap<BrokerId, BrokerSession>>,
    topics: AsyncRwLock<HashMap<TopicName, TopicInfo>>,
    session_timeout: Duration,
}

impl Registry {
    fn new(session_timeout: Duration) -> Self {
        Self {
            brokers: AsyncRwLock::new(HashMap::new()),
            topics: AsyncRwLock::new(HashMap::new()),
            session_timeout,
        }
    }

    pub async fn register_broker(&self, info: BrokerInfo) -> SessionId {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut brokers = self.brokers.write().await;
        info!(broker_id = %info.id, %session_id, "Broker registered with coordinator");
        brokers.insert(
            info.id.clone(),
            BrokerSession {
                info,
                session_id: session_id.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        session_id
    }

    pub async fn heartbeat(&self, broker_id: &str) -> Result<()> {
        let mut brokers = self.brokers.write().await;
        match brokers.get_mut(broker_id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(BrokerUnitError::BrokerNotFound(broker_id.to_string())),
        }
    }

    pub async fn deregister_broker(&self, broker_id: &str) {
        let mut brokers = self.brokers.write().await;
        if brokers.remove(broker_id).is_some() {
            info!(%broker_id, "Broker deregistered from coordinator");
        }
    }

    pub async fn create_topic(&self, topic: TopicInfo) -> Result<()> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(&topic.name) {
            return Err(BrokerUnitError::TopicAlreadyExists(topic.name));
        }
        debug!(topic = %topic.name, partitions = topic.partitions, "Topic registered");
        topics.insert(topic.name.clone(), topic);
        Ok(())
    }

    pub async fn get_topic(&self, name: &str) -> Option<TopicInfo> {
        self.topics.read().await.get(name).cloned()
    }

    pub async fn list_topics(&self) -> Vec<TopicInfo> {
        self.topics.read().await.values().cloned().collect()
    }

    pub async fn live_brokers(&self) -> Vec<BrokerInfo> {
        self.brokers
            .read()
            .await
            .values()
            .map(|s| s.info.clone())
            .collect()
    }

    /// Drop sessions whose heartbeat is older than the session timeout.
    pub async fn expire_sessions(&self) -> usize {
        let mut brokers = self.brokers.write().await;
        let timeout = self.session_timeout;
        let before = brokers.len();
        brokers.retain(|broker_id, session| {
            let alive = session.last_heartbeat.elapsed() < timeout;
            if !alive {
                warn!(%broker_id, session_id = %session.session_id, "Broker session expired");
            }
            alive
        });
        before - brokers.len()
    }
}

/// In-process coordination service with start/stop lifecycle.
pub struct Coordinator {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Bind the listener and start serving. The actual address (relevant when
    /// the config asks for port 0) is available via `local_addr`.
    pub async fn start(config: CoordinatorConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen).await.map_err(|e| {
            BrokerUnitError::Coordinator(format!("failed to bind {}: {e}", config.listen))
        })?;
        let local_addr = listener.local_addr()?;
        info!("Coordination service listening on {local_addr}");

        let registry = Arc::new(Registry::new(Duration::from_millis(
            config.session_timeout_ms,
        )));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let accept_registry = registry.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Coordination service shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "Coordinator connection accepted");
                                let registry = accept_registry.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, registry).await {
                                        debug!(%peer, "Coordinator connection closed: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Coordinator accept error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let expiry_registry = registry.clone();
        let expiry_interval = Duration::from_millis(config.session_timeout_ms.max(2) / 2);
        let expiry_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(expiry_interval);
            loop {
                interval.tick().await;
                expiry_registry.expire_sessions().await;
            }
        });

        Ok(Self {
            registry,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            tasks: vec![accept_task, expiry_task],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connect_string(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Stop accepting connections and drop all background tasks.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        // Await cancellation so the accept task has dropped the listener and
        // released the port before stop() returns.
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("Coordination service stopped");
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    loop {
        let request = match read_frame::<CoordinatorRequest>(&mut stream).await {
            Ok(request) => request,
            // Clean EOF when the peer hangs up between requests.
            Err(BrokerUnitError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        let response = dispatch(request, &registry).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn dispatch(request: CoordinatorRequest, registry: &Registry) -> CoordinatorResponse {
    match request {
        CoordinatorRequest::RegisterBroker(info) => {
            let session_id = registry.register_broker(info).await;
            CoordinatorResponse::Registered { session_id }
        }
        CoordinatorRequest::Heartbeat { broker_id } => match registry.heartbeat(&broker_id).await {
            Ok(()) => CoordinatorResponse::HeartbeatAck,
            Err(e) => CoordinatorResponse::Error(e.to_string()),
        },
        CoordinatorRequest::DeregisterBroker { broker_id } => {
            registry.deregister_broker(&broker_id).await;
            CoordinatorResponse::Deregistered
        }
        CoordinatorRequest::CreateTopic(topic) => match registry.create_topic(topic).await {
            Ok(()) => CoordinatorResponse::TopicCreated,
            Err(e) => CoordinatorResponse::Error(e.to_string()),
        },
        CoordinatorRequest::GetTopic { name } => {
            CoordinatorResponse::Topic(registry.get_topic(&name).await)
        }
        CoordinatorRequest::ListTopics => {
            CoordinatorResponse::Topics(registry.list_topics().await)
        }
    }
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BrokerUnitError::Network(format!(
            "coordinator frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    Ok(())
}

/// Client side of the coordinator protocol, used by brokers and the harness.
pub struct CoordinatorClient {
    stream: TcpStream,
}

impl CoordinatorClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            BrokerUnitError::Coordinator(format!("failed to connect to coordinator {addr}: {e}"))
        })?;
        Ok(Self { stream })
    }

    async fn request(&mut self, request: CoordinatorRequest) -> Result<CoordinatorResponse> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream).await
    }

    pub async fn register_broker(&mut self, info: BrokerInfo) -> Result<SessionId> {
        match self.request(CoordinatorRequest::RegisterBroker(info)).await? {
            CoordinatorResponse::Registered { session_id } => Ok(session_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&mut self, broker_id: &str) -> Result<()> {
        match self
            .request(CoordinatorRequest::Heartbeat {
                broker_id: broker_id.to_string(),
            })
            .await?
        {
            CoordinatorResponse::HeartbeatAck => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn deregister_broker(&mut self, broker_id: &str) -> Result<()> {
        match self
            .request(CoordinatorRequest::DeregisterBroker {
                broker_id: broker_id.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Deregistered => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_topic(&mut self, topic: TopicInfo) -> Result<()> {
        match self.request(CoordinatorRequest::CreateTopic(topic)).await? {
            CoordinatorResponse::TopicCreated => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_topic(&mut self, name: &str) -> Result<Option<TopicInfo>> {
        match self
            .request(CoordinatorRequest::GetTopic {
                name: name.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Topic(topic) => Ok(topic),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_topics(&mut self) -> Result<Vec<TopicInfo>> {
        match self.request(CoordinatorRequest::ListTopics).await? {
            CoordinatorResponse::Topics(topics) => Ok(topics),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: CoordinatorResponse) -> BrokerUnitError {
    match response {
        CoordinatorResponse::Error(message) => BrokerUnitError::Coordinator(message),
        other => BrokerUnitError::Coordinator(format!("unexpected response: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_info(id: &str) -> BrokerInfo {
        BrokerInfo {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9092,
        }
    }

    fn topic_info(name: &str) -> TopicInfo {
        TopicInfo {
            name: name.to_string(),
            partitions: 1,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_registry_register_and_heartbeat() {
        let registry = Registry::new(Duration::from_secs(10));
        registry.register_broker(broker_info("broker-1")).await;

        assert!(registry.heartbeat("broker-1").await.is_ok());
        assert!(registry.heartbeat("broker-2").await.is_err());
        assert_eq!(registry.live_brokers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_session_expiry() {
        let registry = Registry::new(Duration::from_millis(20));
        registry.register_broker(broker_info("broker-1")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let expired = registry.expire_sessions().await;
        assert_eq!(expired, 1);
        assert!(registry.live_brokers().await.is_empty());
        assert!(registry.heartbeat("broker-1").await.is_err());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_topic() {
        let registry = Registry::new(Duration::from_secs(10));
        registry.create_topic(topic_info("orders")).await.unwrap();

        let result = registry.create_topic(topic_info("orders")).await;
        assert!(matches!(
            result,
            Err(BrokerUnitError::TopicAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let mut coordinator = Coordinator::start(CoordinatorConfig::default())
            .await
            .unwrap();
        let addr = coordinator.connect_string();

        let mut client = CoordinatorClient::connect(&addr).await.unwrap();
        let session_id = client.register_broker(broker_info("broker-1")).await.unwrap();
        assert!(!session_id.is_empty());

        client.heartbeat("broker-1").await.unwrap();
        client.create_topic(topic_info("orders")).await.unwrap();
        assert!(client.create_topic(topic_info("orders")).await.is_err());

        let topic = client.get_topic("orders").await.unwrap();
        assert_eq!(topic.unwrap().name, "orders");
        assert!(client.get_topic("missing").await.unwrap().is_none());

        let topics = client.list_topics().await.unwrap();
        assert_eq!(topics.len(), 1);

        client.deregister_broker("broker-1").await.unwrap();
        assert!(client.heartbeat("broker-1").await.is_err());

        coordinator.stop().await.unwrap();
    }
}

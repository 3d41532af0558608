use crate::config::{NetworkConfig, TlsConfig};
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use bytes::Bytes;
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Per-request payload ceiling, generous for test traffic.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

/// Response frame tag marking a request that failed outside the typed
/// error-code path.
pub const ERROR_FRAME: u8 = 255;

#[async_trait::async_trait]
pub trait ProduceHandler: Send + Sync {
    async fn handle_produce(&self, request: ProduceRequest) -> Result<ProduceResponse>;
}

#[async_trait::async_trait]
pub trait FetchHandler: Send + Sync {
    async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

#[async_trait::async_trait]
pub trait MetadataHandler: Send + Sync {
    async fn handle_metadata(&self, request: MetadataRequest) -> Result<MetadataResponse>;
}

#[async_trait::async_trait]
pub trait CreateTopicHandler: Send + Sync {
    async fn handle_create_topic(&self, request: CreateTopicRequest) -> Result<CreateTopicResponse>;
}

pub struct RequestRouter {
    produce_handler: Arc<dyn ProduceHandler>,
    fetch_handler: Arc<dyn FetchHandler>,
    metadata_handler: Arc<dyn MetadataHandler>,
    create_topic_handler: Arc<dyn CreateTopicHandler>,
}

impl RequestRouter {
    pub fn new(
        produce_handler: Arc<dyn ProduceHandler>,
        fetch_handler: Arc<dyn FetchHandler>,
        metadata_handler: Arc<dyn MetadataHandler>,
        create_topic_handler: Arc<dyn CreateTopicHandler>,
    ) -> Self {
        Self {
            produce_handler,
            fetch_handler,
            metadata_handler,
            create_topic_handler,
        }
    }

    pub async fn route_request(&self, request_type: RequestType, data: Bytes) -> Result<Bytes> {
        match request_type {
            RequestType::Produce => {
                let request: ProduceRequest = bincode::deserialize(&data)?;
                let response = self.produce_handler.handle_produce(request).await?;
                Ok(Bytes::from(bincode::serialize(&response)?))
            }
            RequestType::Fetch => {
                let request: FetchRequest = bincode::deserialize(&data)?;
                let response = self.fetch_handler.handle_fetch(request).await?;
                Ok(Bytes::from(bincode::serialize(&response)?))
            }
            RequestType::Metadata => {
                let request: MetadataRequest = bincode::deserialize(&data)?;
                let response = self.metadata_handler.handle_metadata(request).await?;
                Ok(Bytes::from(bincode::serialize(&response)?))
            }
            RequestType::CreateTopic => {
                let request: CreateTopicRequest = bincode::deserialize(&data)?;
                let response = self.create_topic_handler.handle_create_topic(request).await?;
                Ok(Bytes::from(bincode::serialize(&response)?))
            }
        }
    }
}

/// QUIC listener carrying the broker's request/response protocol: one bidirectional
/// stream per request, a type byte followed by a bincode payload each way.
pub struct QuicServer {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    request_router: Arc<RequestRouter>,
}

impl QuicServer {
    pub fn new(config: &NetworkConfig, tls: &TlsConfig, router: RequestRouter) -> Result<Self> {
        let crypto = match (tls.enabled, &tls.cert_store) {
            (true, Some(store)) => store.server_config()?,
            (true, None) => {
                return Err(BrokerUnitError::InvalidConfig(
                    "tls.cert_store is required when tls.enabled is true".to_string(),
                ))
            }
            _ => Self::self_signed_config()?,
        };

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let transport_config = Arc::get_mut(&mut server_config.transport)
            .ok_or_else(|| BrokerUnitError::Network("transport config unavailable".to_string()))?;
        transport_config.max_concurrent_bidi_streams(1000_u32.into());
        transport_config.max_idle_timeout(Some(
            Duration::from_millis(config.connection_timeout_ms)
                .try_into()
                .map_err(|_| {
                    BrokerUnitError::InvalidConfig(
                        "network.connection_timeout_ms out of range".to_string(),
                    )
                })?,
        ));

        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| BrokerUnitError::Config(format!("Invalid listen address: {e}")))?;
        let endpoint = Endpoint::server(server_config, addr)?;
        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            endpoint,
            local_addr,
            request_router: Arc::new(router),
        })
    }

    /// Throwaway certificate for the non-cert-store mode. The transport is
    /// still encrypted; clients skip verification.
    fn self_signed_config() -> Result<rustls::ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
        let cert_der = cert.serialize_der()?;
        let priv_key = cert.serialize_private_key_der();

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(cert_der)],
                rustls::PrivateKey(priv_key),
            )?;
        Ok(config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for closing the endpoint from outside the serve task.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub async fn serve(self) -> Result<()> {
        info!("Broker QUIC server listening on {}", self.local_addr);

        while let Some(conn) = self.endpoint.accept().await {
            let connection = match conn.await {
                Ok(connection) => connection,
                Err(e) => {
                    debug!("Handshake failed: {e}");
                    continue;
                }
            };
            debug!("Connection accepted from {}", connection.remote_address());

            let router = self.request_router.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(connection, router).await {
                    debug!("Connection closed: {e}");
                }
            });
        }

        Ok(())
    }

    async fn handle_connection(
        connection: quinn::Connection,
        router: Arc<RequestRouter>,
    ) -> Result<()> {
        loop {
            let (mut send, mut recv) = match connection.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let router = router.clone();

            tokio::spawn(async move {
                let frame = match recv.read_to_end(MAX_REQUEST_BYTES).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Failed to read request: {e}");
                        return;
                    }
                };
                if frame.is_empty() {
                    return;
                }

                let response = match RequestType::try_from(frame[0]) {
                    Ok(request_type) => {
                        let data = Bytes::from(frame[1..].to_vec());
                        match router.route_request(request_type, data).await {
                            Ok(payload) => {
                                let mut framed = Vec::with_capacity(payload.len() + 1);
                                framed.push(request_type as u8);
                                framed.extend_from_slice(&payload);
                                framed
                            }
                            Err(e) => {
                                error!("Request processing error: {e}");
                                error_frame(&e)
                            }
                        }
                    }
                    Err(e) => error_frame(&e),
                };

                if let Err(e) = send.write_all(&response).await {
                    debug!("Failed to send response: {e}");
                    return;
                }
                if let Err(e) = send.finish().await {
                    debug!("Failed to finish stream: {e}");
                }
            });
        }
    }
}

fn error_frame(error: &BrokerUnitError) -> Vec<u8> {
    let message = error.to_string();
    let mut framed = Vec::with_capacity(message.len() + 1);
    framed.push(ERROR_FRAME);
    framed.extend_from_slice(message.as_bytes());
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProduceHandler;
    struct MockFetchHandler;
    struct MockMetadataHandler;
    struct MockCreateTopicHandler;

    #[async_trait::async_trait]
    impl ProduceHandler for MockProduceHandler {
        async fn handle_produce(&self, _request: ProduceRequest) -> Result<ProduceResponse> {
            Ok(ProduceResponse {
                base_offset: 123,
                error_code: error_code::NONE,
                error_message: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl FetchHandler for MockFetchHandler {
        async fn handle_fetch(&self, _request: FetchRequest) -> Result<FetchResponse> {
            Ok(FetchResponse {
                records: vec![],
                high_watermark: 456,
                error_code: error_code::NONE,
                error_message: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl MetadataHandler for MockMetadataHandler {
        async fn handle_metadata(&self, _request: MetadataRequest) -> Result<MetadataResponse> {
            Ok(MetadataResponse {
                broker: BrokerInfo {
                    id: "broker-1".to_string(),
                    host: "localhost".to_string(),
                    port: 9092,
                },
                topics: vec![],
            })
        }
    }

    #[async_trait::async_trait]
    impl CreateTopicHandler for MockCreateTopicHandler {
        async fn handle_create_topic(
            &self,
            _request: CreateTopicRequest,
        ) -> Result<CreateTopicResponse> {
            Ok(CreateTopicResponse {
                error_code: error_code::NONE,
                error_message: None,
            })
        }
    }

    fn router() -> RequestRouter {
        RequestRouter::new(
            Arc::new(MockProduceHandler),
            Arc::new(MockFetchHandler),
            Arc::new(MockMetadataHandler),
            Arc::new(MockCreateTopicHandler),
        )
    }

    #[tokio::test]
    async fn test_request_router_produce() {
        let request = ProduceRequest {
            topic: "test-topic".to_string(),
            partition: None,
            records: vec![],
        };
        let data = bincode::serialize(&request).unwrap();
        let response = router()
            .route_request(RequestType::Produce, Bytes::from(data))
            .await
            .unwrap();

        let response: ProduceResponse = bincode::deserialize(&response).unwrap();
        assert_eq!(response.base_offset, 123);
        assert_eq!(response.error_code, error_code::NONE);
    }

    #[tokio::test]
    async fn test_request_router_metadata() {
        let request = MetadataRequest { topics: vec![] };
        let data = bincode::serialize(&request).unwrap();
        let response = router()
            .route_request(RequestType::Metadata, Bytes::from(data))
            .await
            .unwrap();

        let response: MetadataResponse = bincode::deserialize(&response).unwrap();
        assert_eq!(response.broker.id, "broker-1");
    }

    #[test]
    fn test_error_frame_is_tagged() {
        let frame = error_frame(&BrokerUnitError::Timeout);
        assert_eq!(frame[0], ERROR_FRAME);
        assert!(String::from_utf8_lossy(&frame[1..]).contains("timeout"));
    }
}

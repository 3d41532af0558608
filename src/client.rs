//! QUIC client for the broker's request/response protocol. Used internally by
//! the harness and directly by tests standing in for an external producer or
//! consumer.

use crate::broker::server::{ERROR_FRAME, MAX_REQUEST_BYTES};
use crate::certstore::{insecure_client_config, CertStoreConfig};
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use quinn::Endpoint;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

/// How the client authenticates the broker (and itself).
#[derive(Debug, Clone)]
pub enum ClientTlsMode {
    /// Encrypted but unverified, for brokers running on a throwaway
    /// self-signed certificate. Presents no client certificate.
    Insecure,
    /// Verify the broker against the cert store's CA and present the store's
    /// client certificate.
    CertStore(CertStoreConfig),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker_addr: String,
    pub tls: ClientTlsMode,
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    pub fn insecure(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            tls: ClientTlsMode::Insecure,
            connect_timeout_ms: 5_000,
        }
    }

    pub fn with_cert_store(broker_addr: impl Into<String>, store: CertStoreConfig) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            tls: ClientTlsMode::CertStore(store),
            connect_timeout_ms: 5_000,
        }
    }
}

pub struct BrokerClient {
    endpoint: Endpoint,
    connection: quinn::Connection,
}

impl BrokerClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let crypto = match &config.tls {
            ClientTlsMode::Insecure => insecure_client_config(),
            ClientTlsMode::CertStore(store) => store.client_config()?,
        };

        let bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let addr: SocketAddr = config
            .broker_addr
            .parse()
            .map_err(|e| BrokerUnitError::Config(format!("Invalid broker address: {e}")))?;
        let connecting = endpoint.connect(addr, "localhost")?;
        let connection = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| BrokerUnitError::Timeout)??;

        Ok(Self {
            endpoint,
            connection,
        })
    }

    async fn request<R: DeserializeOwned>(
        &self,
        request_type: RequestType,
        payload: &impl serde::Serialize,
    ) -> Result<R> {
        let body = bincode::serialize(payload)?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(request_type as u8);
        frame.extend_from_slice(&body);

        let (mut send, mut recv) = self.connection.open_bi().await?;
        send.write_all(&frame).await?;
        send.finish().await?;

        let response = recv.read_to_end(MAX_REQUEST_BYTES).await?;
        match response.first() {
            None => Err(BrokerUnitError::Network("empty response".to_string())),
            Some(&ERROR_FRAME) => Err(BrokerUnitError::Broker(
                String::from_utf8_lossy(&response[1..]).to_string(),
            )),
            Some(&tag) if tag == request_type as u8 => Ok(bincode::deserialize(&response[1..])?),
            Some(&tag) => Err(BrokerUnitError::Network(format!(
                "mismatched response tag: {tag}"
            ))),
        }
    }

    /// Produce a batch to one topic partition, returning the base offset.
    pub async fn produce(
        &self,
        topic: &str,
        partition: Option<PartitionId>,
        records: Vec<Record>,
    ) -> Result<Offset> {
        let response: ProduceResponse = self
            .request(
                RequestType::Produce,
                &ProduceRequest {
                    topic: topic.to_string(),
                    partition,
                    records,
                },
            )
            .await?;
        check_error(topic, response.error_code, response.error_message)?;
        Ok(response.base_offset)
    }

    /// Produce a single harness-facing record, returning its offset.
    pub async fn produce_record(&self, record: ProduceRecord) -> Result<Offset> {
        let wire_record = Record {
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.produce(&record.topic, record.partition, vec![wire_record])
            .await
    }

    pub async fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        fetch_offset: Offset,
        max_records: u32,
    ) -> Result<FetchResponse> {
        let response: FetchResponse = self
            .request(
                RequestType::Fetch,
                &FetchRequest {
                    topic: topic.to_string(),
                    partition,
                    fetch_offset,
                    max_records,
                },
            )
            .await?;
        check_error(topic, response.error_code, response.error_message.clone())?;
        Ok(response)
    }

    pub async fn metadata(&self, topics: Vec<TopicName>) -> Result<MetadataResponse> {
        self.request(RequestType::Metadata, &MetadataRequest { topics })
            .await
    }

    pub async fn create_topic(&self, name: &str, partitions: u32) -> Result<()> {
        let response: CreateTopicResponse = self
            .request(
                RequestType::CreateTopic,
                &CreateTopicRequest {
                    name: name.to_string(),
                    partitions,
                },
            )
            .await?;
        check_error(name, response.error_code, response.error_message)
    }

    pub fn close(&self) {
        self.connection.close(0u32.into(), b"done");
        self.endpoint.close(0u32.into(), b"done");
    }
}

fn check_error(topic: &str, code: u32, message: Option<String>) -> Result<()> {
    match code {
        error_code::NONE => Ok(()),
        error_code::TOPIC_NOT_FOUND => Err(BrokerUnitError::TopicNotFound(topic.to_string())),
        error_code::TOPIC_ALREADY_EXISTS => {
            Err(BrokerUnitError::TopicAlreadyExists(topic.to_string()))
        }
        error_code::PARTITION_NOT_FOUND => Err(BrokerUnitError::Broker(
            message.unwrap_or_else(|| "partition not found".to_string()),
        )),
        _ => Err(BrokerUnitError::Broker(
            message.unwrap_or_else(|| format!("broker error code {code}")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_error_maps_codes() {
        assert!(check_error("t", error_code::NONE, None).is_ok());
        assert!(matches!(
            check_error("t", error_code::TOPIC_NOT_FOUND, None),
            Err(BrokerUnitError::TopicNotFound(_))
        ));
        assert!(matches!(
            check_error("t", error_code::TOPIC_ALREADY_EXISTS, None),
            Err(BrokerUnitError::TopicAlreadyExists(_))
        ));
        assert!(check_error("t", error_code::UNKNOWN, Some("boom".into())).is_err());
    }

    #[test]
    fn test_client_config_constructors() {
        let config = ClientConfig::insecure("127.0.0.1:9092");
        assert!(matches!(config.tls, ClientTlsMode::Insecure));

        let store = CertStoreConfig::new("/tmp/certs");
        let config = ClientConfig::with_cert_store("127.0.0.1:9092", store);
        assert!(matches!(config.tls, ClientTlsMode::CertStore(_)));
    }
}

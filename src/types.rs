use serde::{Deserialize, Serialize};
use std::fmt;

pub type BrokerId = String;
pub type TopicName = String;
pub type PartitionId = u32;
pub type Offset = u64;
pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

/// Record as held in a partition log, with its assigned offset and checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub offset: Offset,
    pub record: Record,
    pub crc32: u32,
}

impl StoredRecord {
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
}

impl BrokerInfo {
    pub fn connect_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: TopicName,
    pub partitions: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Record handed to the harness or client for producing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRecord {
    pub topic: TopicName,
    pub partition: Option<PartitionId>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
}

impl ProduceRecord {
    pub fn new(
        topic: impl Into<TopicName>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: Some(key.into()),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    pub fn without_key(topic: impl Into<TopicName>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            headers: Vec::new(),
        }
    }
}

/// Record handed back from a read, with its origin attached.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
    pub timestamp: i64,
}

impl ConsumedRecord {
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub topic: TopicName,
    pub partition: Option<PartitionId>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub base_offset: Offset,
    pub error_code: u32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub fetch_offset: Offset,
    pub max_records: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub records: Vec<StoredRecord>,
    pub high_watermark: Offset,
    pub error_code: u32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub topics: Vec<TopicName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub broker: BrokerInfo,
    pub topics: Vec<TopicInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTopicRequest {
    pub name: TopicName,
    pub partitions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTopicResponse {
    pub error_code: u32,
    pub error_message: Option<String>,
}

/// Error codes carried in wire responses.
pub mod error_code {
    pub const NONE: u32 = 0;
    pub const TOPIC_NOT_FOUND: u32 = 1;
    pub const TOPIC_ALREADY_EXISTS: u32 = 2;
    pub const PARTITION_NOT_FOUND: u32 = 3;
    pub const MESSAGE_TOO_LARGE: u32 = 4;
    pub const UNKNOWN: u32 = 100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Produce = 1,
    Fetch = 2,
    Metadata = 3,
    CreateTopic = 4,
}

impl TryFrom<u8> for RequestType {
    type Error = crate::error::BrokerUnitError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(RequestType::Produce),
            2 => Ok(RequestType::Fetch),
            3 => Ok(RequestType::Metadata),
            4 => Ok(RequestType::CreateTopic),
            _ => Err(crate::error::BrokerUnitError::Network(format!(
                "Invalid request type: {value}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_conversion() {
        assert!(matches!(RequestType::try_from(1).unwrap(), RequestType::Produce));
        assert!(matches!(RequestType::try_from(2).unwrap(), RequestType::Fetch));
        assert!(matches!(RequestType::try_from(3).unwrap(), RequestType::Metadata));
        assert!(matches!(RequestType::try_from(4).unwrap(), RequestType::CreateTopic));
        assert!(RequestType::try_from(99).is_err());
    }

    #[test]
    fn test_produce_record_constructors() {
        let record = ProduceRecord::new("orders", "key", "value");
        assert_eq!(record.key.as_deref(), Some(b"key".as_slice()));
        assert_eq!(record.value, b"value");
        assert!(record.partition.is_none());

        let record = ProduceRecord::without_key("orders", "value");
        assert!(record.key.is_none());
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition {
            topic: "orders".to_string(),
            partition: 3,
        };
        assert_eq!(tp.to_string(), "orders:3");
    }
}

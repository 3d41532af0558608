use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerUnitError>;

#[derive(Error, Debug)]
pub enum BrokerUnitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Coordinator error: {0}")]
    Coordinator(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(u32),

    #[error("Broker not found: {0}")]
    BrokerNotFound(String),

    #[error("Message of {size} bytes exceeds message.max.bytes ({max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Record checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("Operation timeout")]
    Timeout,

    #[error("Timed out reading from topic {topic}: expected {expected} messages, received {received}")]
    ReadTimeout {
        topic: String,
        expected: usize,
        received: usize,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("QUIC error: {0}")]
    Quic(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    #[error("QUIC write error: {0}")]
    QuicWrite(#[from] quinn::WriteError),

    #[error("QUIC read error: {0}")]
    QuicRead(#[from] quinn::ReadToEndError),
}

pub mod broker;
pub mod certstore;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod harness;
pub mod types;

pub use certstore::{generate_cert_store, CertStoreConfig};
pub use client::{BrokerClient, ClientConfig, ClientTlsMode};
pub use config::Config;
pub use error::{BrokerUnitError, Result};
pub use harness::BrokerUnit;
pub use types::{ConsumedRecord, ProduceRecord};

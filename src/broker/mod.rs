pub mod broker;
pub mod core;
pub mod server;

pub use broker::{Broker, BrokerState};
pub use core::BrokerCore;
pub use server::QuicServer;

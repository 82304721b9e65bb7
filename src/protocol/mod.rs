//! Broker-facing payloads and topic rules

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

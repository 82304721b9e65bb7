//! Testing utilities and mock implementations
//!
//! Lets the retry, health and connection paths run without 1-Wire hardware
//! or an MQTT broker.

pub mod logs;
pub mod mocks;

pub use logs::{capture_logs, LogCapture};
pub use mocks::*;

//! Process bootstrap for the relay: configuration, key loading and the
//! listener lifecycle.

pub mod config;
pub mod controller;

pub use config::{ConfigError, RelayConfig};
pub use controller::Relay;

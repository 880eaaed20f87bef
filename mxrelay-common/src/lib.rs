//! Types shared between the inbound acceptor and the delivery pipeline.

pub mod address;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod logging;
pub mod status;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

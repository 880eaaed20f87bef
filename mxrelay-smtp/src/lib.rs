//! Inbound SMTP acceptor for the relay.
//!
//! Speaks just enough of RFC 5321 to collect one envelope per transaction and
//! hand it to an [`EnvelopeHandler`](mxrelay_common::handler::EnvelopeHandler).
//! Whatever the handler answers becomes the reply to the final `.`.

pub mod command;
pub mod listener;
pub mod session;

pub use listener::{DEFAULT_SHUTDOWN_GRACE, Listener};
pub use session::{DEFAULT_MAX_MESSAGE_SIZE, Session, SessionConfig, SessionTimeouts};

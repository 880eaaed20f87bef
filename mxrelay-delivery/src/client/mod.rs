//! Minimal SMTP client used to hand a message to a remote exchange.
//!
//! Supports plain TCP with an optional STARTTLS upgrade. Commands are sent one
//! at a time; pipelining is not used.

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::Response;
pub use smtp_client::{SmtpClient, dot_stuff};

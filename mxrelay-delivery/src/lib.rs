//! Next-hop resolution, DKIM signing and delivery of relayed messages.
//!
//! An accepted envelope flows through [`RelayPipeline`]:
//!
//! 1. [`AddressResolver`] splits the recipient and looks up the domain's MX records
//! 2. an optional [`MessageSigner`] prepends a `DKIM-Signature` header
//! 3. [`DeliveryAttempter`] tries each exchanger in preference order until one accepts

pub mod attempt;
pub mod client;
pub mod dkim;
pub mod dns;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod testing;

pub use attempt::{DEFAULT_HOST_TIMEOUT, Delivered, DeliveryAttempter, HostFailure};
pub use dkim::{DkimConfig, DkimSigner, KeyLoadError, MessageSigner, SigningError};
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MxLookup};
pub use error::RelayError;
pub use pipeline::RelayPipeline;
pub use resolver::{AddressResolver, CandidateHosts};
pub use transport::{SmtpTimeouts, SmtpTransport, Stage, Transport, TransportError};

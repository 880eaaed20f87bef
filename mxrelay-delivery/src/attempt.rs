//! Ordered delivery across candidate hosts.

use std::{fmt, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    error::RelayError,
    transport::{Transport, TransportError},
};

/// Default bound on one complete attempt against one host.
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(300);

/// One host that did not accept the message.
#[derive(Debug)]
pub struct HostFailure {
    pub host: String,
    pub error: TransportError,
}

impl HostFailure {
    /// Returns `true` if the host refused the message with a 5xx reply.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.error.is_permanent()
    }
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.error)
    }
}

/// A successful delivery.
#[derive(Debug)]
pub struct Delivered {
    /// The host that accepted the message.
    pub host: String,
    /// Hosts tried and failed before `host`, in order.
    pub failures: Vec<HostFailure>,
}

/// Tries each candidate host in turn until one accepts the message.
///
/// Every failure, temporary or permanent, moves on to the next host; no host
/// is tried twice and nothing is retried later.
#[derive(Clone)]
pub struct DeliveryAttempter {
    transport: Arc<dyn Transport>,
    host_timeout: Duration,
}

impl DeliveryAttempter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            host_timeout: DEFAULT_HOST_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_host_timeout(mut self, host_timeout: Duration) -> Self {
        self.host_timeout = host_timeout;
        self
    }

    /// # Errors
    ///
    /// Returns [`RelayError::DeliveryExhausted`] carrying one failure per host
    /// when no host accepted the message.
    pub async fn deliver(
        &self,
        hosts: &[String],
        sender: &str,
        recipient: &str,
        payload: &[u8],
    ) -> Result<Delivered, RelayError> {
        let mut failures = Vec::with_capacity(hosts.len());

        for host in hosts {
            let attempt = self.transport.send(host, sender, recipient, payload);

            let error = match tokio::time::timeout(self.host_timeout, attempt).await {
                Ok(Ok(())) => {
                    info!(host, attempts = failures.len() + 1, "Delivered");
                    return Ok(Delivered {
                        host: host.clone(),
                        failures,
                    });
                }
                Ok(Err(error)) => error,
                Err(_) => TransportError::AttemptTimeout(self.host_timeout),
            };

            warn!(
                host,
                permanent = error.is_permanent(),
                %error,
                "Delivery attempt failed"
            );
            failures.push(HostFailure {
                host: host.clone(),
                error,
            });
        }

        Err(RelayError::DeliveryExhausted {
            hosts: hosts.to_vec(),
            failures,
        })
    }
}

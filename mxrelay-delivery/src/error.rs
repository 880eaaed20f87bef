//! Error taxonomy of a single relay operation.

use mxrelay_common::{
    error::AddressError,
    status::{Rejection, Status},
};
use thiserror::Error;

use crate::{attempt::HostFailure, dkim::SigningError, dns::DnsError};

/// Why an envelope could not be relayed.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The recipient does not split into a local part and a domain.
    #[error(transparent)]
    MalformedAddress(#[from] AddressError),

    /// The recipient domain has no usable mail exchangers.
    #[error("Failed to resolve mail exchangers for {domain}: {source}")]
    Resolution {
        domain: String,
        #[source]
        source: DnsError,
    },

    /// A signer is configured and refused the message.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// Every candidate host was tried and none accepted the message.
    #[error("Delivery failed on all {} host(s): {}", hosts.len(), summarize(failures))]
    DeliveryExhausted {
        hosts: Vec<String>,
        failures: Vec<HostFailure>,
    },
}

fn summarize(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RelayError {
    /// Returns `true` if the submitting client may retry the same envelope later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        !matches!(self, Self::MalformedAddress(_))
    }
}

impl From<&RelayError> for Rejection {
    fn from(err: &RelayError) -> Self {
        let status = if err.is_temporary() {
            Status::ActionUnavailable
        } else {
            Status::Error
        };

        let enhanced = match err {
            RelayError::MalformedAddress(_) => "5.1.3",
            RelayError::Resolution { .. } => "4.4.3",
            RelayError::Signing(_) => "4.7.0",
            RelayError::DeliveryExhausted { .. } => "4.4.1",
        };

        Self::new(status, enhanced, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::{Stage, TransportError};

    #[test]
    fn malformed_address_is_permanent() {
        let err = RelayError::from(AddressError::Malformed("not-an-email".to_string()));
        assert!(!err.is_temporary());

        let rejection = Rejection::from(&err);
        assert_eq!(
            rejection.to_string(),
            "550 5.1.3 malformed e-mail address: not-an-email"
        );
    }

    #[test]
    fn resolution_failure_is_temporary() {
        let err = RelayError::Resolution {
            domain: "y.com".to_string(),
            source: DnsError::NoMailServers("y.com".to_string()),
        };
        assert!(err.is_temporary());

        let rejection = Rejection::from(&err);
        assert_eq!(rejection.status, Status::ActionUnavailable);
        assert_eq!(rejection.enhanced, "4.4.3");
    }

    #[test]
    fn exhausted_lists_every_host() {
        let err = RelayError::DeliveryExhausted {
            hosts: vec!["mx1.y.com".to_string(), "mx2.y.com".to_string()],
            failures: vec![
                HostFailure {
                    host: "mx1.y.com".to_string(),
                    error: TransportError::Rejected {
                        stage: Stage::RcptTo,
                        code: 550,
                        message: "User unknown".to_string(),
                    },
                },
                HostFailure {
                    host: "mx2.y.com".to_string(),
                    error: TransportError::Rejected {
                        stage: Stage::Greeting,
                        code: 421,
                        message: "Busy".to_string(),
                    },
                },
            ],
        };

        assert_eq!(
            err.to_string(),
            "Delivery failed on all 2 host(s): mx1.y.com: Server rejected RCPT TO: 550 User unknown; \
             mx2.y.com: Server rejected greeting: 421 Busy"
        );
        assert!(err.is_temporary());

        let rejection = Rejection::from(&err);
        assert_eq!(rejection.status, Status::ActionUnavailable);
        assert_eq!(rejection.enhanced, "4.4.1");
    }

    #[test]
    fn signing_failure_is_temporary() {
        let err = RelayError::from(SigningError::new("key rejected"));
        assert!(err.is_temporary());

        let rejection = Rejection::from(&err);
        assert_eq!(
            rejection.to_string(),
            "451 4.7.0 DKIM signing failed: key rejected"
        );
    }
}

//! Recipient to candidate host resolution.

use std::sync::Arc;

use mxrelay_common::address::Recipient;
use tracing::debug;

use crate::{
    dns::{DnsError, MxLookup},
    error::RelayError,
};

/// Ordered, non-empty list of hosts eligible to receive a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateHosts {
    domain: String,
    hosts: Vec<String>,
}

impl CandidateHosts {
    /// The recipient domain these hosts were resolved for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Hosts in delivery order, most preferred first.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

/// Removes a single trailing `.` from a fully qualified host name.
#[must_use]
pub fn normalize_host(host: &str) -> &str {
    host.strip_suffix('.').unwrap_or(host)
}

/// Turns a recipient address into the ordered set of hosts to try.
#[derive(Clone)]
pub struct AddressResolver {
    lookup: Arc<dyn MxLookup>,
}

impl AddressResolver {
    pub fn new(lookup: Arc<dyn MxLookup>) -> Self {
        Self { lookup }
    }

    /// Parses `recipient` and resolves its domain to candidate hosts.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedAddress`] without performing a lookup if
    /// the address is malformed, and [`RelayError::Resolution`] if the lookup
    /// fails or yields nothing.
    pub async fn resolve(&self, recipient: &str) -> Result<CandidateHosts, RelayError> {
        let recipient = Recipient::parse(recipient)?;
        let domain = recipient.domain();

        let servers = self
            .lookup
            .lookup_mx(domain)
            .await
            .map_err(|source| RelayError::Resolution {
                domain: domain.to_string(),
                source,
            })?;

        let mut servers = servers.to_vec();
        servers.sort_by_key(|s| s.priority);

        let hosts: Vec<String> = servers
            .iter()
            .map(|s| normalize_host(&s.host).to_string())
            .collect();

        if hosts.is_empty() {
            return Err(RelayError::Resolution {
                domain: domain.to_string(),
                source: DnsError::NoMailServers(domain.to_string()),
            });
        }

        debug!(domain, ?hosts, "Resolved candidate hosts");

        Ok(CandidateHosts {
            domain: domain.to_string(),
            hosts,
        })
    }
}

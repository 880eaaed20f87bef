//! Recipient address parsing.
//!
//! The relay only needs the domain part of a recipient to find its next hop,
//! so parsing is deliberately shallow: an address is valid when splitting on
//! `@` yields exactly two non-empty parts.

use core::fmt::{self, Display, Formatter};

use crate::error::AddressError;

/// A recipient address that has been checked to contain exactly one `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    address: String,
    at: usize,
}

impl Recipient {
    /// Parses a recipient address.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Malformed`] if the address does not split into
    /// exactly two non-empty parts around a single `@`.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let mut parts = address.split('@');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
                Ok(Self {
                    address: address.to_string(),
                    at: local.len(),
                })
            }
            _ => Err(AddressError::Malformed(address.to_string())),
        }
    }

    /// The part before the `@`.
    #[inline]
    pub fn local_part(&self) -> &str {
        &self.address[..self.at]
    }

    /// The part after the `@`.
    #[inline]
    pub fn domain(&self) -> &str {
        &self.address[self.at + 1..]
    }
}

impl Display for Recipient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

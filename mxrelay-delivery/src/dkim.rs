//! DKIM signing of outbound messages.
//!
//! The signing key is loaded once at startup; a [`DkimSigner`] is immutable
//! afterwards and shared between all concurrent relay operations.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::{self, Canonicalization, Done},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, pem::PemObject};

/// Headers covered by the signature when present in the message.
pub const SIGNED_HEADERS: [&str; 12] = [
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "Reply-To",
    "In-Reply-To",
    "References",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

/// Signing failed for a particular message.
#[derive(Debug, Error)]
#[error("DKIM signing failed: {0}")]
pub struct SigningError(String);

impl SigningError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<mail_auth::Error> for SigningError {
    fn from(err: mail_auth::Error) -> Self {
        Self(err.to_string())
    }
}

/// The signing key could not be loaded at startup.
#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("Failed to read DKIM key {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse DKIM key {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Produces a signed copy of a raw message.
pub trait MessageSigner: Send + Sync {
    /// Returns the message with a `DKIM-Signature` header prepended. The
    /// original bytes follow unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError`] if the signing library fails.
    fn sign(&self, raw: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Where the signing key lives and what identity it signs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Signing domain (`d=`).
    pub domain: String,
    /// Selector (`s=`).
    pub selector: String,
    /// Path to the PEM encoded RSA private key.
    pub key_path: PathBuf,
}

/// RSA-SHA256 DKIM signer with relaxed/relaxed canonicalization.
pub struct DkimSigner {
    domain: String,
    selector: String,
    signer: dkim::DkimSigner<RsaKey<Sha256>, Done>,
}

impl fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkimSigner")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl DkimSigner {
    /// Loads the private key named by `config` and builds a signer.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLoadError`] if the file cannot be read or holds neither a
    /// PKCS#1 nor a PKCS#8 RSA key.
    pub fn load(config: &DkimConfig) -> Result<Self, KeyLoadError> {
        let pem = fs::read_to_string(&config.key_path).map_err(|source| KeyLoadError::Read {
            path: config.key_path.clone(),
            source,
        })?;

        Self::from_pem(&pem, &config.domain, &config.selector).map_err(|reason| {
            KeyLoadError::Parse {
                path: config.key_path.clone(),
                reason,
            }
        })
    }

    /// Builds a signer from a PEM encoded RSA key, either PKCS#1 or PKCS#8.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure.
    pub fn from_pem(pem: &str, domain: &str, selector: &str) -> Result<Self, String> {
        let der = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| e.to_string())?;
        let key = RsaKey::<Sha256>::from_key_der(der).map_err(|e| e.to_string())?;

        let signer = dkim::DkimSigner::from_key(key)
            .domain(domain)
            .selector(selector)
            .headers(SIGNED_HEADERS)
            .header_canonicalization(Canonicalization::Relaxed)
            .body_canonicalization(Canonicalization::Relaxed);

        Ok(Self {
            domain: domain.to_string(),
            selector: selector.to_string(),
            signer,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }
}

impl MessageSigner for DkimSigner {
    fn sign(&self, raw: &[u8]) -> Result<Vec<u8>, SigningError> {
        let header = self.signer.sign(raw)?.to_header();

        let mut signed = Vec::with_capacity(header.len() + raw.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(raw);
        Ok(signed)
    }
}

/// Resolves the key file name against the DKIM configuration directory.
///
/// Absolute key paths are used as given.
#[must_use]
pub fn key_path(dir: &Path, key_file: &str) -> PathBuf {
    dir.join(key_file)
}

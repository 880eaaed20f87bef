//! Relay configuration.
//!
//! Values come from an optional RON file named by `MXRELAY_CONFIG`, after
//! which any `SMTP_*` environment variable that is set takes precedence:
//!
//! | variable              | field                 | default                |
//! |-----------------------|-----------------------|------------------------|
//! | `SMTP_LISTEN`         | `listen`              | `0.0.0.0:25`           |
//! | `SMTP_DKIMKEY`        | `dkim_key`            | `dkim.key`             |
//! | `SMTP_DKIMSELECTOR`   | `dkim_selector`       | `default`              |
//! | `SMTP_DKIMDOMAIN`     | `dkim_domain`         | `example.com`          |
//! | `SMTP_DKIMPATH`       | `dkim_path`           | `/etc/smtprelay/dkim`  |
//! | `SMTP_HOSTNAME`       | `hostname`            | `$HOSTNAME`, `localhost` |
//! | `SMTP_HOSTTIMEOUT`    | `host_timeout_secs`   | `300`                  |
//! | `SMTP_SHUTDOWNGRACE`  | `shutdown_grace_secs` | `30`                   |
//! | `SMTP_MAXMESSAGESIZE` | `max_message_size`    | `10485760`             |
//!
//! The `dns`, `timeouts` and `session` sections can only be set from the file.

use std::{
    fmt::Display,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use mxrelay_delivery::{DkimConfig, DnsConfig, SmtpTimeouts, dkim};
use mxrelay_smtp::{DEFAULT_MAX_MESSAGE_SIZE, SessionTimeouts};
use serde::Deserialize;
use thiserror::Error;

/// Names the RON configuration file.
pub const CONFIG_VARIABLE: &str = "MXRELAY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("Invalid value {value:?} for {variable}: {reason}")]
    InvalidVariable {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 25))
}

fn default_dkim_key() -> String {
    String::from("dkim.key")
}

fn default_dkim_selector() -> String {
    String::from("default")
}

fn default_dkim_domain() -> String {
    String::from("example.com")
}

fn default_dkim_path() -> PathBuf {
    PathBuf::from("/etc/smtprelay/dkim")
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| String::from("localhost"))
}

const fn default_host_timeout_secs() -> u64 {
    300
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Key file name, resolved under `dkim_path`
    #[serde(default = "default_dkim_key")]
    pub dkim_key: String,

    #[serde(default = "default_dkim_selector")]
    pub dkim_selector: String,

    #[serde(default = "default_dkim_domain")]
    pub dkim_domain: String,

    #[serde(default = "default_dkim_path")]
    pub dkim_path: PathBuf,

    /// Name announced in the banner and in outbound EHLO
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bound on a whole delivery attempt against one exchanger
    #[serde(default = "default_host_timeout_secs")]
    pub host_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Largest message accepted, in bytes. 0 disables the limit.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Outbound per-command timeouts
    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    /// Inbound idle timeouts
    #[serde(default)]
    pub session: SessionTimeouts,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            dkim_key: default_dkim_key(),
            dkim_selector: default_dkim_selector(),
            dkim_domain: default_dkim_domain(),
            dkim_path: default_dkim_path(),
            hostname: default_hostname(),
            host_timeout_secs: default_host_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_message_size: default_max_message_size(),
            dns: DnsConfig::default(),
            timeouts: SmtpTimeouts::default(),
            session: SessionTimeouts::default(),
        }
    }
}

fn parsed<T>(variable: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidVariable {
            variable,
            reason: err.to_string(),
            value,
        })
}

impl RelayConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration file cannot be read or
    /// parsed, or a variable holds a value of the wrong type.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = std::env::var_os(CONFIG_VARIABLE).map(PathBuf::from);
        Self::load(file.as_deref(), |variable| std::env::var(variable).ok())
    }

    /// Loads the configuration from `file`, if given, then applies the
    /// variables `lookup` knows about.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn load(
        file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply(lookup)?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        ron::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = var("SMTP_LISTEN") {
            self.listen = parsed("SMTP_LISTEN", value)?;
        }
        if let Some(value) = var("SMTP_DKIMKEY") {
            self.dkim_key = value;
        }
        if let Some(value) = var("SMTP_DKIMSELECTOR") {
            self.dkim_selector = value;
        }
        if let Some(value) = var("SMTP_DKIMDOMAIN") {
            self.dkim_domain = value;
        }
        if let Some(value) = var("SMTP_DKIMPATH") {
            self.dkim_path = PathBuf::from(value);
        }
        if let Some(value) = var("SMTP_HOSTNAME") {
            self.hostname = value;
        }
        if let Some(value) = var("SMTP_HOSTTIMEOUT") {
            self.host_timeout_secs = parsed("SMTP_HOSTTIMEOUT", value)?;
        }
        if let Some(value) = var("SMTP_SHUTDOWNGRACE") {
            self.shutdown_grace_secs = parsed("SMTP_SHUTDOWNGRACE", value)?;
        }
        if let Some(value) = var("SMTP_MAXMESSAGESIZE") {
            self.max_message_size = parsed("SMTP_MAXMESSAGESIZE", value)?;
        }

        Ok(())
    }

    /// Signing identity and the resolved key location.
    pub fn dkim(&self) -> DkimConfig {
        DkimConfig {
            domain: self.dkim_domain.clone(),
            selector: self.dkim_selector.clone(),
            key_path: dkim::key_path(&self.dkim_path, &self.dkim_key),
        }
    }

    pub const fn host_timeout(&self) -> Duration {
        Duration::from_secs(self.host_timeout_secs)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

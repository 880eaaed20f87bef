//! Outbound transmission of a single message to a single exchange.
//!
//! A [`Transport`] performs one complete SMTP transaction: connect, greeting,
//! EHLO (HELO if EHLO is refused), opportunistic STARTTLS, MAIL FROM, one
//! RCPT TO, DATA and QUIT. If the TLS upgrade fails the connection is dropped
//! and the transaction is repeated in plaintext (RFC 3207 Section 4.1).

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ClientError, Response, SmtpClient};

/// Well-known SMTP relay port.
pub const SMTP_PORT: u16 = 25;

/// SMTP operation timeout configuration.
///
/// Every command of a transaction is bounded separately; the whole attempt
/// against one host is additionally bounded by the delivery attempter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// Connection establishment plus greeting (default: 30 seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// EHLO/HELO (default: 30 seconds)
    #[serde(default = "default_command_timeout")]
    pub ehlo_secs: u64,

    /// STARTTLS command and TLS handshake (default: 30 seconds)
    #[serde(default = "default_command_timeout")]
    pub starttls_secs: u64,

    /// MAIL FROM (default: 30 seconds)
    #[serde(default = "default_command_timeout")]
    pub mail_from_secs: u64,

    /// RCPT TO (default: 30 seconds)
    #[serde(default = "default_command_timeout")]
    pub rcpt_to_secs: u64,

    /// DATA and message transmission, longer to accommodate large messages
    /// (default: 120 seconds)
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// QUIT (default: 10 seconds)
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_command_timeout(),
            starttls_secs: default_command_timeout(),
            mail_from_secs: default_command_timeout(),
            rcpt_to_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    const fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Connect | Stage::Greeting => self.connect_secs,
            Stage::Ehlo => self.ehlo_secs,
            Stage::StartTls => self.starttls_secs,
            Stage::MailFrom => self.mail_from_secs,
            Stage::RcptTo => self.rcpt_to_secs,
            Stage::Data | Stage::Message => self.data_secs,
        };
        Duration::from_secs(secs)
    }
}

/// The step of an SMTP transaction an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Greeting,
    Ehlo,
    StartTls,
    MailFrom,
    RcptTo,
    Data,
    Message,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Greeting => "greeting",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Message => "message data",
        })
    }
}

/// Errors produced by a single transmission attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP connection could not be established.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: ClientError,
    },

    /// The remote server answered a step with an unexpected reply.
    #[error("Server rejected {stage}: {code} {message}")]
    Rejected {
        stage: Stage,
        code: u16,
        message: String,
    },

    /// A step did not complete in time.
    #[error("{stage} timed out after {timeout:?}")]
    Timeout { stage: Stage, timeout: Duration },

    /// The attempt as a whole exceeded the per-host bound.
    #[error("Attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    /// The conversation broke down (I/O, TLS or an unparseable reply).
    #[error("{stage} failed: {source}")]
    Client {
        stage: Stage,
        #[source]
        source: ClientError,
    },
}

impl TransportError {
    /// Returns `true` if the remote server gave a 5xx reply.
    ///
    /// Everything else (connection problems, timeouts, 4xx) is transient.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 500)
    }

    fn rejected(stage: Stage, response: &Response) -> Self {
        Self::Rejected {
            stage,
            code: response.code,
            message: response.message(),
        }
    }
}

/// Hands one message for one recipient to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing the step that failed.
    async fn send(
        &self,
        host: &str,
        sender: &str,
        recipient: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

/// Outcome of TLS negotiation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiationOutcome {
    /// TLS was successfully negotiated via STARTTLS
    Success,
    /// The server does not advertise STARTTLS
    Skipped,
    /// STARTTLS failed; reconnect and continue in plaintext
    RetryWithoutTls,
}

/// [`Transport`] speaking SMTP over TCP.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    helo_name: String,
    port: u16,
    timeouts: SmtpTimeouts,
}

impl SmtpTransport {
    /// Creates a transport that introduces itself as `helo_name` and connects to port 25.
    #[must_use]
    pub fn new(helo_name: impl Into<String>, timeouts: SmtpTimeouts) -> Self {
        Self {
            helo_name: helo_name.into(),
            port: SMTP_PORT,
            timeouts,
        }
    }

    /// Overrides the destination port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn timed<T>(
        &self,
        stage: Stage,
        operation: impl Future<Output = crate::client::Result<T>> + Send,
    ) -> Result<T, TransportError> {
        let timeout = self.timeouts.for_stage(stage);
        tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| TransportError::Timeout { stage, timeout })?
            .map_err(|source| TransportError::Client { stage, source })
    }

    /// Connect to the host and read its greeting.
    async fn connect_and_greet(&self, host: &str) -> Result<SmtpClient, TransportError> {
        let address = format!("{host}:{}", self.port);
        let timeout = self.timeouts.for_stage(Stage::Connect);

        let mut client = tokio::time::timeout(timeout, SmtpClient::connect(&address, host))
            .await
            .map_err(|_| TransportError::Timeout {
                stage: Stage::Connect,
                timeout,
            })?
            .map_err(|source| TransportError::Connect {
                address: address.clone(),
                source,
            })?;

        let greeting = self.timed(Stage::Greeting, client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(TransportError::rejected(Stage::Greeting, &greeting));
        }

        Ok(client)
    }

    /// Introduce ourselves with EHLO, falling back to HELO when EHLO is refused.
    ///
    /// Returns the response so callers can inspect advertised extensions.
    async fn greet(&self, client: &mut SmtpClient) -> Result<Response, TransportError> {
        let ehlo = self.timed(Stage::Ehlo, client.ehlo(&self.helo_name)).await?;
        if ehlo.is_success() {
            return Ok(ehlo);
        }

        debug!(code = ehlo.code, "EHLO refused, falling back to HELO");
        let helo = self.timed(Stage::Ehlo, client.helo(&self.helo_name)).await?;
        if helo.is_success() {
            Ok(helo)
        } else {
            Err(TransportError::rejected(Stage::Ehlo, &helo))
        }
    }

    async fn negotiate_tls(
        &self,
        host: &str,
        client: &mut SmtpClient,
    ) -> Result<TlsNegotiationOutcome, TransportError> {
        let ehlo = self.greet(client).await?;
        if !ehlo.has_extension("STARTTLS") {
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        match self.timed(Stage::StartTls, client.starttls()).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                info!(
                    server = host,
                    response = %response.message(),
                    "Server rejected STARTTLS, will retry without TLS per RFC 3207"
                );
                return Ok(TlsNegotiationOutcome::RetryWithoutTls);
            }
            Err(error) => {
                info!(
                    server = host,
                    %error,
                    "STARTTLS failed, will retry without TLS per RFC 3207"
                );
                return Ok(TlsNegotiationOutcome::RetryWithoutTls);
            }
        }

        // Re-send EHLO after STARTTLS (RFC 3207)
        self.greet(client).await?;
        debug!(server = host, "TLS successfully negotiated via STARTTLS");

        Ok(TlsNegotiationOutcome::Success)
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    #[tracing::instrument(level = "debug", skip(self, payload), fields(port = self.port, size = payload.len()))]
    async fn send(
        &self,
        host: &str,
        sender: &str,
        recipient: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut client = self.connect_and_greet(host).await?;

        if self.negotiate_tls(host, &mut client).await? == TlsNegotiationOutcome::RetryWithoutTls {
            drop(client);
            client = self.connect_and_greet(host).await?;
            self.greet(&mut client).await?;
            info!(
                server = host,
                "Reconnected without TLS, proceeding with plaintext delivery"
            );
        }

        let response = self
            .timed(Stage::MailFrom, client.mail_from(sender))
            .await?;
        if !response.is_success() {
            return Err(TransportError::rejected(Stage::MailFrom, &response));
        }

        let response = self
            .timed(Stage::RcptTo, client.rcpt_to(recipient))
            .await?;
        if !response.is_success() {
            return Err(TransportError::rejected(Stage::RcptTo, &response));
        }

        let response = self.timed(Stage::Data, client.data()).await?;
        if !response.is_intermediate() {
            return Err(TransportError::rejected(Stage::Data, &response));
        }

        let response = self
            .timed(Stage::Message, client.send_data(payload))
            .await?;
        if !response.is_success() {
            return Err(TransportError::rejected(Stage::Message, &response));
        }

        // The message is delivered at this point; a failed QUIT changes nothing.
        let quit_timeout = Duration::from_secs(self.timeouts.quit_secs);
        match tokio::time::timeout(quit_timeout, client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(server = host, "QUIT failed after successful delivery: {e}"),
            Err(_) => warn!(
                server = host,
                timeout = ?quit_timeout,
                "QUIT timed out after successful delivery"
            ),
        }

        Ok(())
    }
}

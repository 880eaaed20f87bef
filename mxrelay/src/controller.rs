use std::sync::Arc;

use mxrelay_common::{Signal, handler::EnvelopeHandler, internal, logging};
use mxrelay_delivery::{
    AddressResolver, DeliveryAttempter, DkimSigner, DnsResolver, MessageSigner, MxLookup,
    RelayPipeline, SmtpTransport, Transport,
};
use mxrelay_smtp::{Listener, SessionConfig};
use tokio::sync::broadcast;

use crate::config::RelayConfig;

/// Wires the configured pieces together and runs the relay until shut down.
pub struct Relay {
    config: RelayConfig,
}

impl Relay {
    pub const fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Loads the DKIM key. Without a usable key the relay runs unsigned.
    pub fn signer(&self) -> Option<Arc<dyn MessageSigner>> {
        let dkim = self.config.dkim();

        match DkimSigner::load(&dkim) {
            Ok(signer) => {
                internal!(
                    level = INFO,
                    "DKIM signing enabled for {} with selector {}",
                    signer.domain(),
                    signer.selector()
                );
                Some(Arc::new(signer))
            }
            Err(err) => {
                internal!(level = WARN, "{err}; relaying without DKIM signatures");
                None
            }
        }
    }

    /// Builds the relay pipeline on top of the given lookup and transport.
    pub fn pipeline(
        &self,
        lookup: Arc<dyn MxLookup>,
        transport: Arc<dyn Transport>,
    ) -> RelayPipeline {
        RelayPipeline::new(
            AddressResolver::new(lookup),
            DeliveryAttempter::new(transport).with_host_timeout(self.config.host_timeout()),
        )
        .with_signer(self.signer())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_banner(self.config.hostname.as_str())
            .with_max_message_size(self.config.max_message_size)
            .with_timeouts(self.config.session)
    }

    /// Binds the listener and serves until the shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be created, the listen address
    /// cannot be bound, or the signal handlers cannot be installed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        let lookup = Arc::new(DnsResolver::with_dns_config(self.config.dns.clone())?);
        let transport = Arc::new(SmtpTransport::new(
            self.config.hostname.clone(),
            self.config.timeouts.clone(),
        ));

        let handler: Arc<dyn EnvelopeHandler> = Arc::new(self.pipeline(lookup, transport));

        let listener = Listener::bind(self.config.listen, handler, self.session_config())
            .await?
            .with_shutdown_grace(self.config.shutdown_grace());

        listener.serve(shutdown).await;
        Ok(())
    }

    /// Run the relay, and everything it controls
    ///
    /// # Errors
    ///
    /// See [`Relay::serve`].
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!(
            level = INFO,
            "Starting relay: listen={}, hostname={}, dkim domain={}, selector={}, key={}",
            self.config.listen,
            self.config.hostname,
            self.config.dkim_domain,
            self.config.dkim_selector,
            self.config.dkim().key_path.display()
        );

        let (sender, receiver) = broadcast::channel(16);
        let serve = self.serve(receiver);
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => return result,
            result = wait_for_signal() => result?,
        }

        sender.send(Signal::Shutdown)?;

        tokio::select! {
            result = serve => result?,
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
            }
        }

        internal!(level = INFO, "Shut down");
        Ok(())
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    const RSA_PKCS1: &str = include_str!("../tests/fixtures/rsa.pem");

    fn relay_with_key(dir: &std::path::Path) -> Relay {
        Relay::new(RelayConfig {
            dkim_path: dir.to_path_buf(),
            dkim_key: String::from("relay.key"),
            dkim_domain: String::from("x.com"),
            ..RelayConfig::default()
        })
    }

    #[test]
    fn missing_key_relays_unsigned() {
        let dir = tempfile::tempdir().unwrap();
        assert!(relay_with_key(dir.path()).signer().is_none());
    }

    #[test]
    fn unparsable_key_relays_unsigned() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("relay.key")).unwrap();
        file.write_all(b"not a key").unwrap();

        assert!(relay_with_key(dir.path()).signer().is_none());
    }

    #[test]
    fn key_in_dkim_directory_enables_signing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("relay.key"), RSA_PKCS1).unwrap();

        let signer = relay_with_key(dir.path()).signer().unwrap();
        let signed = signer.sign(b"From: a@x.com\r\n\r\nHi\r\n").unwrap();

        assert!(signed.starts_with(b"DKIM-Signature:"));
        assert!(String::from_utf8_lossy(&signed).contains("d=x.com"));
    }

    #[test]
    fn session_config_follows_relay_config() {
        let relay = Relay::new(RelayConfig {
            hostname: String::from("relay.x.com"),
            max_message_size: 2048,
            ..RelayConfig::default()
        });

        let session = relay.session_config();
        assert_eq!(session.banner(), "relay.x.com");
        assert_eq!(session.max_message_size(), 2048);
    }
}

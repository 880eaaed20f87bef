//! The relay pipeline: validate, resolve, sign, deliver.

use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use mxrelay_common::{envelope::Envelope, handler::EnvelopeHandler, status::Rejection};
use tracing::{info, warn};

use crate::{
    attempt::{Delivered, DeliveryAttempter},
    dkim::MessageSigner,
    error::RelayError,
    resolver::AddressResolver,
};

/// Relays one envelope at a time to the recipient's mail exchangers.
///
/// Stages run strictly in order and the first failing stage ends the run:
/// a malformed recipient is never looked up, and a message that fails to sign
/// is never transmitted.
#[derive(Clone)]
pub struct RelayPipeline {
    resolver: AddressResolver,
    signer: Option<Arc<dyn MessageSigner>>,
    attempter: DeliveryAttempter,
}

impl RelayPipeline {
    pub fn new(resolver: AddressResolver, attempter: DeliveryAttempter) -> Self {
        Self {
            resolver,
            signer: None,
            attempter,
        }
    }

    /// Sets the signer applied to every message. `None` relays unsigned.
    #[must_use]
    pub fn with_signer(mut self, signer: Option<Arc<dyn MessageSigner>>) -> Self {
        self.signer = signer;
        self
    }

    pub const fn is_signing(&self) -> bool {
        self.signer.is_some()
    }

    /// Relays `envelope` to the first candidate host that accepts it.
    ///
    /// # Errors
    ///
    /// Returns the [`RelayError`] of the first stage that failed.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(sender = %envelope.sender(), recipient = %envelope.recipient())
    )]
    pub async fn relay(&self, envelope: &Envelope) -> Result<Delivered, RelayError> {
        let candidates = self
            .resolver
            .resolve(envelope.recipient())
            .await
            .inspect_err(|error| warn!(%error, "Recipient could not be resolved"))?;

        info!(
            domain = candidates.domain(),
            hosts = ?candidates.hosts(),
            "Resolved recipient domain"
        );

        let payload = match &self.signer {
            Some(signer) => {
                let signed = signer
                    .sign(envelope.data())
                    .inspect_err(|error| warn!(%error, "Signing failed"))?;
                info!(size = signed.len(), "Message signed");
                Cow::Owned(signed)
            }
            None => Cow::Borrowed(envelope.data()),
        };

        let delivered = self
            .attempter
            .deliver(
                candidates.hosts(),
                envelope.sender(),
                envelope.recipient(),
                &payload,
            )
            .await
            .inspect_err(|error| warn!(%error, "Relay failed"))?;

        info!(
            host = %delivered.host,
            failed_hosts = delivered.failures.len(),
            "Relayed"
        );

        Ok(delivered)
    }
}

#[async_trait]
impl EnvelopeHandler for RelayPipeline {
    async fn handle(&self, envelope: Envelope) -> Result<String, Rejection> {
        self.relay(&envelope)
            .await
            .map(|delivered| format!("Ok: relayed via {}", delivered.host))
            .map_err(|err| Rejection::from(&err))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mxrelay_common::status::Status;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{Behaviour, FakeSigner, ScriptedTransport, StaticLookup};

    const MESSAGE: &[u8] = b"From: a@x.com\r\nTo: b@y.com\r\nSubject: Hi\r\n\r\nHello\r\n";

    fn pipeline(
        lookup: &Arc<StaticLookup>,
        transport: &Arc<ScriptedTransport>,
        signer: Option<Arc<FakeSigner>>,
    ) -> RelayPipeline {
        RelayPipeline::new(
            AddressResolver::new(lookup.clone()),
            DeliveryAttempter::new(transport.clone()).with_host_timeout(Duration::from_secs(5)),
        )
        .with_signer(signer.map(|s| s as Arc<dyn MessageSigner>))
    }

    #[tokio::test]
    async fn falls_back_to_second_exchanger() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10), ("mx2.y.com.", 20)]);
        let transport = ScriptedTransport::new(&[
            ("mx1.y.com", Behaviour::Refuse(421)),
            ("mx2.y.com", Behaviour::Accept),
        ]);

        let delivered = pipeline(&lookup, &transport, None)
            .relay(&Envelope::new("a@x.com", "b@y.com", MESSAGE))
            .await
            .unwrap();

        assert_eq!(delivered.host, "mx2.y.com");
        assert_eq!(delivered.failures.len(), 1);

        let contacts = transport.contacts();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[1].sender, "a@x.com");
        assert_eq!(contacts[1].recipient, "b@y.com");
        assert_eq!(contacts[1].payload, MESSAGE);
    }

    #[tokio::test]
    async fn malformed_recipient_stops_before_lookup() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10)]);
        let transport = ScriptedTransport::new(&[("mx1.y.com", Behaviour::Accept)]);
        let signer = FakeSigner::working();

        let err = pipeline(&lookup, &transport, Some(signer.clone()))
            .relay(&Envelope::new("a@x.com", "not-an-email", MESSAGE))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::MalformedAddress(_)));
        assert_eq!(lookup.calls(), 0);
        assert_eq!(signer.calls(), 0);
        assert!(transport.contacts().is_empty());
    }

    #[tokio::test]
    async fn signing_failure_stops_before_transmission() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10)]);
        let transport = ScriptedTransport::new(&[("mx1.y.com", Behaviour::Accept)]);
        let signer = FakeSigner::failing();

        let err = pipeline(&lookup, &transport, Some(signer.clone()))
            .relay(&Envelope::new("a@x.com", "b@y.com", MESSAGE))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Signing(_)));
        assert_eq!(signer.calls(), 1);
        assert!(transport.contacts().is_empty());
    }

    #[tokio::test]
    async fn signed_payload_is_transmitted() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10)]);
        let transport = ScriptedTransport::new(&[("mx1.y.com", Behaviour::Accept)]);

        pipeline(&lookup, &transport, Some(FakeSigner::working()))
            .relay(&Envelope::new("a@x.com", "b@y.com", MESSAGE))
            .await
            .unwrap();

        let payload = &transport.contacts()[0].payload;
        assert!(payload.starts_with(FakeSigner::HEADER));
        assert!(payload.ends_with(MESSAGE));
    }

    #[tokio::test]
    async fn unresolvable_domain_is_reported() {
        let lookup = StaticLookup::new(&[]);
        let transport = ScriptedTransport::new(&[]);

        let err = pipeline(&lookup, &transport, None)
            .relay(&Envelope::new("a@x.com", "b@nomx.example", MESSAGE))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Resolution { .. }));
        assert!(transport.contacts().is_empty());
    }

    #[tokio::test]
    async fn handler_replies_with_relaying_host() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10)]);
        let transport = ScriptedTransport::new(&[("mx1.y.com", Behaviour::Accept)]);

        let reply = pipeline(&lookup, &transport, None)
            .handle(Envelope::new("", "b@y.com", MESSAGE))
            .await
            .unwrap();

        assert_eq!(reply, "Ok: relayed via mx1.y.com");
        assert_eq!(transport.contacts()[0].sender, "");
    }

    #[tokio::test]
    async fn handler_maps_exhaustion_to_temporary_rejection() {
        let lookup = StaticLookup::new(&[("mx1.y.com.", 10), ("mx2.y.com.", 20)]);
        let transport = ScriptedTransport::new(&[]);

        let rejection = pipeline(&lookup, &transport, None)
            .handle(Envelope::new("a@x.com", "b@y.com", MESSAGE))
            .await
            .unwrap_err();

        assert_eq!(rejection.status, Status::ActionUnavailable);
        assert_eq!(rejection.enhanced, "4.4.1");
        assert_eq!(transport.contacted(), ["mx1.y.com", "mx2.y.com"]);
    }
}

use async_trait::async_trait;

use crate::{envelope::Envelope, status::Rejection};

/// Receives each envelope accepted by the inbound acceptor.
///
/// `Ok` carries the text appended to the `250` reply; `Err` becomes the
/// rejection sent back to the submitting client for that message.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<String, Rejection>;
}

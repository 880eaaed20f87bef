use std::sync::Arc;

use crate::error::EnvelopeError;

/// One accepted message, narrowed to the single recipient the relay handles.
///
/// The acceptor collects recipients as a list; [`Envelope::from_recipients`] is
/// where that list is narrowed, so nothing downstream ever sees more than one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: String,
    recipient: String,
    data: Arc<[u8]>,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            data: data.into(),
        }
    }

    /// Builds an envelope from the recipient list collected during a session.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NoRecipients`] for an empty list and
    /// [`EnvelopeError::TooManyRecipients`] when more than one was collected.
    pub fn from_recipients(
        sender: impl Into<String>,
        recipients: Vec<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self, EnvelopeError> {
        let count = recipients.len();
        let mut recipients = recipients.into_iter();

        match (recipients.next(), count) {
            (None, _) => Err(EnvelopeError::NoRecipients),
            (Some(recipient), 1) => Ok(Self::new(sender, recipient, data)),
            (Some(_), count) => Err(EnvelopeError::TooManyRecipients(count)),
        }
    }

    /// The reverse-path, passed through unmodified. Empty for the null sender.
    #[inline]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[inline]
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

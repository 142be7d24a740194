use crate::Message;

/// Result of reading a channel's history after a given sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum History {
    /// Every message after the requested sequence, oldest first. Empty when
    /// the reader is caught up.
    Complete(Vec<Message>),

    /// The requested sequence predates the retained history. Holds whatever
    /// is still retained, oldest first, so the batch does not start right
    /// after the requested sequence.
    Truncated(Vec<Message>),
}

impl History {
    /// Returns the messages regardless of truncation.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Complete(messages) | Self::Truncated(messages) => messages,
        }
    }

    /// Borrows the messages regardless of truncation.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match self {
            Self::Complete(messages) | Self::Truncated(messages) => messages,
        }
    }

    /// Whether older messages than the ones returned were evicted.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated(_))
    }

    /// Whether no message was returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }
}

use bytes::Bytes;

/// A message stored in a channel's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Opaque message body.
    pub payload: Bytes,

    /// Position of the message within its channel, starting at 1.
    pub sequence: u64,
}

impl Message {
    /// Creates a new message.
    pub fn new(payload: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            payload: payload.into(),
            sequence,
        }
    }
}

use firehose_channel_store::ChannelStoreError;
use thiserror::Error;

/// Result type alias for this crate.
pub type Result<T, SE> = std::result::Result<T, Error<SE>>;

/// Requests rejected before any store call or registration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Channel keys must be non-empty and free of control characters.
    #[error("invalid channel key: {0:?}")]
    InvalidChannelKey(String),

    /// Sequences are non-negative integers.
    #[error("invalid sequence: {0:?}")]
    InvalidSequence(String),
}

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error<SE>
where
    SE: ChannelStoreError,
{
    /// The request was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The channel store failed. Not retried.
    #[error("channel store error: {0}")]
    Store(#[source] SE),

    /// The wake-up source of a pending wait went away while it was still
    /// registered.
    #[error("subscription closed while waiting")]
    SubscriptionClosed,
}

pub(crate) fn validate_channel_key(key: &str) -> std::result::Result<(), ProtocolError> {
    if key.is_empty() || key.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidChannelKey(key.to_string()));
    }

    Ok(())
}

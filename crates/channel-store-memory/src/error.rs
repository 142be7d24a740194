use firehose_channel_store::ChannelStoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Channel keys must not be empty.
    #[error("invalid channel key: {0:?}")]
    InvalidKey(String),

    /// The store was switched to unavailable with `set_unavailable`.
    #[error("store unavailable")]
    Unavailable,
}

impl ChannelStoreError for Error {}

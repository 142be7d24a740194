use crate::error::{Error, Result, validate_channel_key};

use bytes::Bytes;
use firehose_channel_store::ChannelStore;
use tracing::{debug, warn};

/// Appends messages to channels and announces them to listeners.
#[derive(Clone, Debug)]
pub struct Publisher<S>
where
    S: ChannelStore,
{
    store: S,
}

impl<S> Publisher<S>
where
    S: ChannelStore,
{
    /// Creates a new publisher writing to `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Appends `payload` to the history of `key` and returns its sequence.
    ///
    /// A failed announcement is logged and otherwise ignored: waiters find
    /// the message on their next history read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for an invalid key and [`Error::Store`] if
    /// the message could not be appended.
    pub async fn publish(
        &self,
        key: &str,
        payload: impl Into<Bytes> + Send,
    ) -> Result<u64, S::Error> {
        validate_channel_key(key)?;

        let sequence = self
            .store
            .append_message(key, payload.into())
            .await
            .map_err(Error::Store)?;

        if let Err(error) = self.store.notify(key, sequence).await {
            warn!(key, sequence, %error, "failed to announce published message");
        }

        debug!(key, sequence, "published message");

        Ok(sequence)
    }
}

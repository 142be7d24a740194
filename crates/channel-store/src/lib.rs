//! Abstract interface for the persistent store behind channels: a bounded,
//! sequenced message history per channel key plus a best-effort notification
//! primitive.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod history;
mod message;

pub use history::History;
pub use message::Message;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::Stream;

/// Marker trait for `ChannelStore` errors
pub trait ChannelStoreError: Clone + Debug + Error + Send + Sync + 'static {}

/// Stream of sequence numbers announced for a single channel key.
///
/// Dropping the stream closes the underlying store-level subscription.
pub type Notifications = Box<dyn Stream<Item = u64> + Send + Unpin>;

/// A trait representing a channel store with asynchronous operations.
///
/// Every channel key owns an ordered history of recent messages and a
/// counter holding the highest sequence ever assigned. The counter survives
/// eviction of old history entries.
#[async_trait]
pub trait ChannelStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: ChannelStoreError;

    /// Atomically assigns the next sequence for `key` and stores `payload`
    /// under it.
    ///
    /// Concurrent appends to the same key never receive the same sequence,
    /// and sequence order matches persistence order.
    async fn append_message(&self, key: &str, payload: Bytes) -> Result<u64, Self::Error>;

    /// Returns the highest sequence assigned for `key`, or 0 if nothing was
    /// ever published.
    async fn current_sequence(&self, key: &str) -> Result<u64, Self::Error>;

    /// Opens a store-level subscription to the notifications of `key`.
    async fn listen(&self, key: &str) -> Result<Notifications, Self::Error>;

    /// Announces that `sequence` was appended to `key`.
    ///
    /// Delivery is best-effort: listeners are only woken up, the messages
    /// themselves must be fetched with [`ChannelStore::read_since`].
    async fn notify(&self, key: &str, sequence: u64) -> Result<(), Self::Error>;

    /// Reads all retained messages of `key` with a sequence greater than
    /// `sequence`, oldest first.
    async fn read_since(&self, key: &str, sequence: u64) -> Result<History, Self::Error>;
}

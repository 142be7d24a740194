//! In-memory (single node) implementation of the channel store for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use firehose_channel_store::{ChannelStore, History, Message, Notifications};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

/// Number of messages retained per channel unless configured otherwise.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Options for the in-memory channel store.
#[derive(Clone, Debug)]
pub struct MemoryChannelStoreOptions {
    /// Maximum number of messages retained per channel. Older messages are
    /// evicted, the sequence counter is kept. Values below 1 are raised to 1.
    pub max_history: usize,

    /// Capacity of each channel's notification buffer. Slow listeners skip
    /// notifications beyond it.
    pub notification_capacity: usize,
}

impl Default for MemoryChannelStoreOptions {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            notification_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    sequence: u64,
    history: VecDeque<Message>,
}

impl ChannelState {
    fn append(&mut self, payload: Bytes, max_history: usize) -> u64 {
        self.sequence += 1;
        self.history.push_back(Message::new(payload, self.sequence));

        while self.history.len() > max_history {
            self.history.pop_front();
        }

        self.sequence
    }

    fn read_since(&self, sequence: u64) -> History {
        if sequence >= self.sequence {
            return History::Complete(Vec::new());
        }

        let first_retained = self
            .history
            .front()
            .map_or(self.sequence + 1, |message| message.sequence);

        let messages = self
            .history
            .iter()
            .filter(|message| message.sequence > sequence)
            .cloned()
            .collect();

        if sequence + 1 < first_retained {
            History::Truncated(messages)
        } else {
            History::Complete(messages)
        }
    }
}

type Senders = Arc<DashMap<String, broadcast::Sender<u64>>>;

/// Notification stream of one listener. Forgets the key's sender once the
/// last listener of the key is dropped.
struct Listener {
    key: String,
    senders: Senders,
    inner: Option<Notifications>,
}

impl Stream for Listener {
    type Item = u64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        self.inner
            .as_mut()
            .map_or(Poll::Ready(None), |inner| Pin::new(inner).poll_next(cx))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // The receiver must be gone before counting the remaining ones.
        drop(self.inner.take());
        self.senders
            .remove_if(&self.key, |_, sender| sender.receiver_count() == 0);
    }
}

/// In-memory channel store.
#[derive(Clone, Debug)]
pub struct MemoryChannelStore {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    notifications: Senders,
    options: MemoryChannelStoreOptions,
    unavailable: Arc<AtomicBool>,
}

impl MemoryChannelStore {
    /// Creates a new `MemoryChannelStore` with options.
    #[must_use]
    pub fn new(options: MemoryChannelStoreOptions) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            notifications: Arc::new(DashMap::new()),
            options: MemoryChannelStoreOptions {
                max_history: options.max_history.max(1),
                notification_capacity: options.notification_capacity.max(1),
            },
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a new `MemoryChannelStore` with default options.
    #[must_use]
    pub fn new_default() -> Self {
        Self::new(MemoryChannelStoreOptions::default())
    }

    /// Makes every following operation fail with [`Error::Unavailable`]
    /// until switched back. Already opened listeners keep working.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of open listeners for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &str) -> usize {
        self.notifications
            .get(key)
            .map_or(0, |sender| sender.receiver_count())
    }

    fn check(&self, key: &str) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }

        if key.is_empty() {
            return Err(Error::InvalidKey(key.to_string()));
        }

        Ok(())
    }
}

impl Default for MemoryChannelStore {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    type Error = Error;

    async fn append_message(&self, key: &str, payload: Bytes) -> Result<u64, Self::Error> {
        self.check(key)?;

        let mut channels = self.channels.lock().await;
        let sequence = channels
            .entry(key.to_string())
            .or_default()
            .append(payload, self.options.max_history);
        drop(channels);

        Ok(sequence)
    }

    async fn current_sequence(&self, key: &str) -> Result<u64, Self::Error> {
        self.check(key)?;

        let channels = self.channels.lock().await;
        Ok(channels.get(key).map_or(0, |state| state.sequence))
    }

    async fn listen(&self, key: &str) -> Result<Notifications, Self::Error> {
        self.check(key)?;

        let receiver = self
            .notifications
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.options.notification_capacity).0)
            .subscribe();

        let lagging_key = key.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(sequence) => Some(sequence),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(key = %lagging_key, skipped, "listener skipped notifications");
                None
            }
        });

        Ok(Box::new(Listener {
            key: key.to_string(),
            senders: self.notifications.clone(),
            inner: Some(Box::new(stream)),
        }))
    }

    async fn notify(&self, key: &str, sequence: u64) -> Result<(), Self::Error> {
        self.check(key)?;

        let delivered = self
            .notifications
            .get(key)
            .is_some_and(|sender| sender.send(sequence).is_ok());

        if !delivered {
            // Nobody listens anymore, forget the sender.
            self.notifications
                .remove_if(key, |_, sender| sender.receiver_count() == 0);
        }

        Ok(())
    }

    async fn read_since(&self, key: &str, sequence: u64) -> Result<History, Self::Error> {
        self.check(key)?;

        let channels = self.channels.lock().await;
        Ok(channels
            .get(key)
            .map_or(History::Complete(Vec::new()), |state| {
                state.read_since(sequence)
            }))
    }
}

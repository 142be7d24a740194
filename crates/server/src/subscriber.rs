use crate::error::{Error, Result};
use crate::message_buffer::{MessageBuffer, Removal, WaiterId};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use firehose_channel_store::{ChannelStore, Notifications};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sequence used for wake-ups that do not stem from a publish, such as a
/// re-established store subscription.
pub const UNKNOWN_SEQUENCE: u64 = 0;

/// Options for the subscriber.
#[derive(Clone, Debug)]
pub struct SubscriberOptions {
    /// Delay between attempts to re-open a store subscription that ended
    /// while waiters were still registered.
    pub relisten_backoff: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            relisten_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
enum Readiness<E> {
    Opening,
    Live,
    Failed(E),
}

struct MultiplexedSubscription<E> {
    cancel: CancellationToken,
    readiness: watch::Receiver<Readiness<E>>,
}

struct Inner<S>
where
    S: ChannelStore,
{
    buffer: Arc<MessageBuffer>,
    options: SubscriberOptions,
    store: S,
    subscriptions: Mutex<HashMap<String, MultiplexedSubscription<S::Error>>>,
}

impl<S> Inner<S>
where
    S: ChannelStore,
{
    /// Must be called with the subscriptions lock held.
    fn open(&self, key: &str) -> MultiplexedSubscription<S::Error> {
        let cancel = CancellationToken::new();
        let (readiness_tx, readiness) = watch::channel(Readiness::Opening);

        debug!(key, "opening store subscription");

        tokio::spawn(listen_loop(
            self.store.clone(),
            self.buffer.clone(),
            key.to_string(),
            cancel.clone(),
            readiness_tx,
            self.options.relisten_backoff,
        ));

        MultiplexedSubscription { cancel, readiness }
    }
}

impl<S> Drop for Inner<S>
where
    S: ChannelStore,
{
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().values() {
            subscription.cancel.cancel();
        }
    }
}

/// Multiplexes many local waiters onto one store subscription per channel
/// key.
///
/// The store subscription for a key is opened when its first waiter
/// registers and closed when its last waiter deregisters. Notifications are
/// fanned out through the [`MessageBuffer`].
pub struct Subscriber<S>
where
    S: ChannelStore,
{
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Subscriber<S>
where
    S: ChannelStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Debug for Subscriber<S>
where
    S: ChannelStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("buffer", &self.inner.buffer)
            .field("options", &self.inner.options)
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl<S> Subscriber<S>
where
    S: ChannelStore,
{
    /// Creates a new subscriber on top of `store`.
    pub fn new(store: S, options: SubscriberOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer: Arc::new(MessageBuffer::new()),
                options,
                store,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a new waiter for `key`, opening the store subscription if
    /// this is the key's first waiter.
    ///
    /// Returns once the store subscription is live, so any publish after this
    /// point wakes the returned registration. While a dropped store
    /// subscription is being re-opened, this waits for the re-open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store subscription could not be
    /// opened. The waiter is deregistered in that case.
    pub async fn register(&self, key: &str) -> Result<Registration<S>, S::Error> {
        let (waiter, wakeups) = self.inner.buffer.waiter();
        let id = waiter.id();

        let mut readiness = {
            let mut subscriptions = self.inner.subscriptions.lock();
            self.inner.buffer.insert(key, waiter);
            subscriptions
                .entry(key.to_string())
                .or_insert_with(|| self.inner.open(key))
                .readiness
                .clone()
        };

        let registration = Registration {
            id,
            key: key.to_string(),
            subscriber: self.clone(),
            wakeups,
        };

        debug!(key, waiter = ?id, "registered waiter");

        let outcome = match readiness
            .wait_for(|readiness| !matches!(readiness, Readiness::Opening))
            .await
        {
            Ok(readiness) => match &*readiness {
                Readiness::Failed(error) => Err(Error::Store(error.clone())),
                Readiness::Opening | Readiness::Live => Ok(()),
            },
            Err(_) => Err(Error::SubscriptionClosed),
        };

        outcome.map(|()| registration)
    }

    /// Removes the waiter `id` from `key`, closing the store subscription if
    /// it was the last one. Returns `false` if the waiter was not registered.
    pub fn deregister(&self, key: &str, id: WaiterId) -> bool {
        let mut subscriptions = self.inner.subscriptions.lock();

        match self.inner.buffer.remove(key, id) {
            Removal::NotRegistered => false,
            Removal::Remaining(waiters) => {
                debug!(key, waiter = ?id, waiters, "deregistered waiter");
                true
            }
            Removal::Emptied => {
                if let Some(subscription) = subscriptions.remove(key) {
                    subscription.cancel.cancel();
                }
                debug!(key, waiter = ?id, "deregistered last waiter, closing store subscription");
                true
            }
        }
    }

    /// Number of waiters currently registered for `key`.
    #[must_use]
    pub fn waiter_count(&self, key: &str) -> usize {
        self.inner.buffer.len(key)
    }

    /// Whether a store subscription exists for `key`.
    #[must_use]
    pub fn is_subscribed(&self, key: &str) -> bool {
        self.inner.subscriptions.lock().contains_key(key)
    }
}

/// A waiter's enrollment with the [`Subscriber`]. Deregisters on drop.
#[derive(Debug)]
pub struct Registration<S>
where
    S: ChannelStore,
{
    id: WaiterId,
    key: String,
    subscriber: Subscriber<S>,
    wakeups: watch::Receiver<u64>,
}

impl<S> Registration<S>
where
    S: ChannelStore,
{
    /// Returns the waiter's id.
    #[must_use]
    pub const fn id(&self) -> WaiterId {
        self.id
    }

    /// Returns the channel key the waiter is registered for.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the next wake-up and returns the announced sequence, or
    /// `None` if the waiter was deregistered in the meantime.
    pub async fn woken(&mut self) -> Option<u64> {
        self.wakeups.changed().await.ok()?;
        Some(*self.wakeups.borrow_and_update())
    }

    /// Deregisters the waiter.
    pub fn release(self) {
        drop(self);
    }
}

impl<S> Drop for Registration<S>
where
    S: ChannelStore,
{
    fn drop(&mut self) {
        self.subscriber.deregister(&self.key, self.id);
    }
}

async fn listen_loop<S>(
    store: S,
    buffer: Arc<MessageBuffer>,
    key: String,
    cancel: CancellationToken,
    readiness: watch::Sender<Readiness<S::Error>>,
    relisten_backoff: Duration,
) where
    S: ChannelStore,
{
    let mut notifications = tokio::select! {
        () = cancel.cancelled() => return,
        result = store.listen(&key) => match result {
            Ok(notifications) => notifications,
            Err(error) => {
                warn!(key = %key, %error, "failed to open store subscription");
                readiness.send_replace(Readiness::Failed(error));
                return;
            }
        },
    };

    readiness.send_replace(Readiness::Live);
    debug!(key = %key, "store subscription live");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = notifications.next() => {
                if let Some(sequence) = next {
                    let woken = buffer.notify(&key, sequence);
                    debug!(key = %key, sequence, woken, "fanned out notification");
                } else {
                    warn!(key = %key, "store subscription ended, re-listening");
                    readiness.send_replace(Readiness::Opening);

                    let Some(reopened) = relisten(&store, &key, &cancel, relisten_backoff).await
                    else {
                        break;
                    };
                    notifications = reopened;
                    readiness.send_replace(Readiness::Live);

                    // Publishes during the outage went unannounced.
                    buffer.notify(&key, UNKNOWN_SEQUENCE);
                }
            }
        }
    }

    debug!(key = %key, "store subscription closed");
}

async fn relisten<S>(
    store: &S,
    key: &str,
    cancel: &CancellationToken,
    backoff: Duration,
) -> Option<Notifications>
where
    S: ChannelStore,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(backoff) => {}
        }

        tokio::select! {
            () = cancel.cancelled() => return None,
            result = store.listen(key) => match result {
                Ok(notifications) => return Some(notifications),
                Err(error) => warn!(key, %error, "failed to re-open store subscription"),
            },
        }
    }
}

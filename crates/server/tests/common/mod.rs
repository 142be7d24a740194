#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use firehose_channel_store::{ChannelStore, History, Notifications};
use firehose_channel_store_memory::{
    Error as MemoryError, MemoryChannelStore, MemoryChannelStoreOptions,
};
use firehose_server::{
    Channel, ChannelHooks, Message, Publisher, SubscribeParams, Subscriber, SubscriberOptions,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

pub const CHANNEL_KEY: &str = "/bears/are/mean";

/// Everything a test needs, wired the way a server process would.
pub struct Harness<S: ChannelStore> {
    pub store: S,
    pub subscriber: Subscriber<S>,
    pub publisher: Publisher<S>,
}

impl<S: ChannelStore> Harness<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, SubscriberOptions::default())
    }

    pub fn with_options(store: S, options: SubscriberOptions) -> Self {
        Self {
            subscriber: Subscriber::new(store.clone(), options),
            publisher: Publisher::new(store.clone()),
            store,
        }
    }

    pub fn channel(&self, key: &str) -> Channel<S> {
        Channel::new(key, self.store.clone(), self.subscriber.clone()).unwrap()
    }

    pub async fn publish_all(&self, key: &str, payloads: &[&str]) {
        for payload in payloads {
            self.publisher
                .publish(key, Bytes::copy_from_slice(payload.as_bytes()))
                .await
                .unwrap();
        }
    }

    pub async fn wait_for_waiters(&self, key: &str, count: usize) {
        let subscriber = self.subscriber.clone();
        eventually(|| subscriber.waiter_count(key) == count).await;
    }
}

pub fn memory_harness() -> Harness<MemoryChannelStore> {
    let _ = tracing_subscriber::fmt::try_init();

    Harness::new(MemoryChannelStore::new_default())
}

pub fn memory_harness_with_history(max_history: usize) -> Harness<MemoryChannelStore> {
    let _ = tracing_subscriber::fmt::try_init();

    Harness::new(MemoryChannelStore::new(MemoryChannelStoreOptions {
        max_history,
        ..Default::default()
    }))
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Lifecycle hook calls in the order they happened.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ChannelHooks for RecordingHooks {
    fn on_subscribe(&self, key: &str, params: &SubscribeParams) {
        let mut params: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        params.sort();
        self.events
            .lock()
            .push(format!("subscribe {key} [{}]", params.join(",")));
    }

    fn on_message(&self, key: &str, message: &Message) {
        self.events.lock().push(format!(
            "message {key} {} {}",
            message.sequence,
            String::from_utf8_lossy(&message.payload)
        ));
    }

    fn on_unsubscribe(&self, key: &str) {
        self.events.lock().push(format!("unsubscribe {key}"));
    }
}

/// Memory store whose individual primitives can be made to fail, stall or
/// misbehave.
#[derive(Clone, Debug)]
pub struct FlakyStore {
    pub inner: MemoryChannelStore,
    fail_notify: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    listeners_closed: Arc<Mutex<CancellationToken>>,
    listens_open: Arc<watch::Sender<bool>>,
    append_on_listen: Arc<Mutex<Option<Bytes>>>,
    canned_reads: Arc<Mutex<Option<History>>>,
    notify_calls: Arc<AtomicUsize>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self {
            inner: MemoryChannelStore::new_default(),
            fail_notify: Arc::default(),
            fail_reads: Arc::default(),
            listeners_closed: Arc::default(),
            listens_open: Arc::new(watch::channel(true).0),
            append_on_listen: Arc::default(),
            canned_reads: Arc::default(),
            notify_calls: Arc::default(),
        }
    }
}

impl FlakyStore {
    /// Makes `listen` stall until [`FlakyStore::release_listens`].
    pub fn hold_listens(&self) {
        self.listens_open.send_replace(false);
    }

    pub fn release_listens(&self) {
        self.listens_open.send_replace(true);
    }

    /// The next `listen` appends `payload` without announcing it, as a
    /// publish racing the subscription would.
    pub fn append_on_next_listen(&self, payload: &'static str) {
        *self.append_on_listen.lock() = Some(Bytes::from_static(payload.as_bytes()));
    }

    /// Every `read_since` answers `history` until reset with `None`.
    pub fn serve_reads(&self, history: Option<History>) {
        *self.canned_reads.lock() = history;
    }

    pub fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    pub fn fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Ends every notification stream handed out so far, as if the store
    /// connection dropped.
    pub fn close_listeners(&self) {
        let mut closed = self.listeners_closed.lock();
        closed.cancel();
        *closed = CancellationToken::new();
    }
}

struct Closable {
    inner: Notifications,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Stream for Closable {
    type Item = u64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        if self.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait]
impl ChannelStore for FlakyStore {
    type Error = MemoryError;

    async fn append_message(&self, key: &str, payload: Bytes) -> Result<u64, Self::Error> {
        self.inner.append_message(key, payload).await
    }

    async fn current_sequence(&self, key: &str) -> Result<u64, Self::Error> {
        self.inner.current_sequence(key).await
    }

    async fn listen(&self, key: &str) -> Result<Notifications, Self::Error> {
        let mut open = self.listens_open.subscribe();
        if open.wait_for(|open| *open).await.is_err() {
            return Err(MemoryError::Unavailable);
        }

        let closed = self.listeners_closed.lock().clone().cancelled_owned();
        let inner = self.inner.listen(key).await?;

        let racing = self.append_on_listen.lock().take();
        if let Some(payload) = racing {
            self.inner.append_message(key, payload).await?;
        }

        Ok(Box::new(Closable {
            inner,
            closed: Box::pin(closed),
        }))
    }

    async fn notify(&self, key: &str, sequence: u64) -> Result<(), Self::Error> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(MemoryError::Unavailable);
        }

        self.inner.notify(key, sequence).await
    }

    async fn read_since(&self, key: &str, sequence: u64) -> Result<History, Self::Error> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MemoryError::Unavailable);
        }

        let canned = self.canned_reads.lock().clone();
        if let Some(history) = canned {
            return Ok(history);
        }

        self.inner.read_since(key, sequence).await
    }
}

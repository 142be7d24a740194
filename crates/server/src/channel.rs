use crate::error::{Error, ProtocolError, Result, validate_channel_key};
use crate::hooks::{ChannelHooks, NoopHooks, SubscribeParams};
use crate::subscriber::{Registration, Subscriber};

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use firehose_channel_store::{ChannelStore, History, Message};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options for a single [`Channel::next_messages`] call.
#[derive(Clone, Debug, Default)]
pub struct NextMessagesOptions {
    /// Give up waiting for a live message after this long. Durations too
    /// large to be represented as a deadline wait forever.
    pub timeout: Option<Duration>,

    /// Fired when the requesting connection goes away.
    pub cancellation: Option<CancellationToken>,
}

impl NextMessagesOptions {
    /// Options with a timeout and no cancellation.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancellation: None,
        }
    }

    /// Adds a cancellation token.
    #[must_use]
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// How a [`Channel::next_messages`] call was resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Answered from history without waiting. The batch is non-empty.
    History(Vec<Message>),

    /// Answered after waiting for a publish. The batch is non-empty.
    Notified(Vec<Message>),

    /// Nothing was published before the timeout.
    TimedOut,

    /// The cancellation token fired before anything was published.
    Cancelled,
}

impl Resolution {
    /// Returns the delivered messages, if any.
    #[must_use]
    pub fn messages(&self) -> Option<&[Message]> {
        match self {
            Self::History(messages) | Self::Notified(messages) => Some(messages),
            Self::TimedOut | Self::Cancelled => None,
        }
    }

    /// Consumes the resolution, returning the delivered messages, if any.
    #[must_use]
    pub fn into_messages(self) -> Option<Vec<Message>> {
        match self {
            Self::History(messages) | Self::Notified(messages) => Some(messages),
            Self::TimedOut | Self::Cancelled => None,
        }
    }
}

/// Parses a raw "since" sequence as received by a transport.
///
/// An absent or blank value means "no sequence given".
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidSequence`] for negative or non-numeric
/// values.
pub fn parse_since(raw: Option<&str>) -> std::result::Result<Option<u64>, ProtocolError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProtocolError::InvalidSequence(value.to_string())),
    }
}

/// Serves "everything after sequence N" requests for one channel key.
///
/// Requests are answered from history when possible, otherwise they wait
/// for a publish through the shared [`Subscriber`].
#[derive(Debug)]
pub struct Channel<S>
where
    S: ChannelStore,
{
    key: String,
    store: S,
    subscriber: Subscriber<S>,
    hooks: Arc<dyn ChannelHooks>,
}

impl<S> Channel<S>
where
    S: ChannelStore,
{
    /// Creates a channel for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `key` is empty or contains control
    /// characters.
    pub fn new(
        key: impl Into<String>,
        store: S,
        subscriber: Subscriber<S>,
    ) -> Result<Self, S::Error> {
        Self::with_hooks(
            key,
            store,
            subscriber,
            Arc::new(NoopHooks),
            &SubscribeParams::new(),
        )
    }

    /// Creates a channel for `key` that reports its lifecycle to `hooks`.
    ///
    /// [`ChannelHooks::on_subscribe`] is called with `params` before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `key` is empty or contains control
    /// characters. No hook is called in that case.
    pub fn with_hooks(
        key: impl Into<String>,
        store: S,
        subscriber: Subscriber<S>,
        hooks: Arc<dyn ChannelHooks>,
        params: &SubscribeParams,
    ) -> Result<Self, S::Error> {
        let key = key.into();
        validate_channel_key(&key)?;

        hooks.on_subscribe(&key, params);

        Ok(Self {
            key,
            store,
            subscriber,
            hooks,
        })
    }

    /// Returns the channel key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the messages published after `since`, oldest first, waiting
    /// for a publish if there are none yet.
    ///
    /// Without `since` (or with 0) the latest message is returned, or the
    /// first one ever published if the channel is still empty.
    ///
    /// The timeout and the cancellation token also apply while the store
    /// subscription is still being opened. Dropping the returned future
    /// deregisters the pending wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if history could not be read before waiting
    /// or the store subscription could not be opened.
    pub async fn next_messages(
        &self,
        since: Option<u64>,
        options: NextMessagesOptions,
    ) -> Result<Resolution, S::Error> {
        let result = self.await_next(since, options).await;

        if let Ok(resolution) = &result {
            for message in resolution.messages().unwrap_or_default() {
                self.hooks.on_message(&self.key, message);
            }
        }
        self.hooks.on_unsubscribe(&self.key);

        result
    }

    async fn await_next(
        &self,
        since: Option<u64>,
        options: NextMessagesOptions,
    ) -> Result<Resolution, S::Error> {
        let since = match since {
            Some(since) if since > 0 => since,
            _ => match self.latest().await? {
                Latest::Message(message) => {
                    debug!(key = %self.key, sequence = message.sequence, "resolved with latest message");
                    return Ok(Resolution::History(vec![message]));
                }
                Latest::WaitAfter(sequence) => sequence,
            },
        };

        let history = self
            .store
            .read_since(&self.key, since)
            .await
            .map_err(Error::Store)?;
        let batch = accept(&self.key, since, history);
        if !batch.is_empty() {
            debug!(key = %self.key, since, count = batch.len(), "resolved from history");
            return Ok(Resolution::History(batch));
        }

        let deadline = options
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let expired = expire(deadline);
        tokio::pin!(expired);
        let disconnected = disconnect(options.cancellation.as_ref());
        tokio::pin!(disconnected);

        let registration = tokio::select! {
            () = expired.as_mut() => {
                debug!(key = %self.key, since, "timed out while subscribing");
                return Ok(Resolution::TimedOut);
            }
            () = disconnected.as_mut() => {
                debug!(key = %self.key, since, "cancelled while subscribing");
                return Ok(Resolution::Cancelled);
            }
            registration = self.subscriber.register(&self.key) => registration?,
        };

        PendingWait {
            channel: self,
            since,
            registration,
        }
        .wait(expired, disconnected)
        .await
    }

    async fn latest(&self) -> Result<Latest, S::Error> {
        let current = self
            .store
            .current_sequence(&self.key)
            .await
            .map_err(Error::Store)?;

        if current == 0 {
            return Ok(Latest::WaitAfter(0));
        }

        let latest = self
            .store
            .read_since(&self.key, current - 1)
            .await
            .map_err(Error::Store)?
            .into_messages()
            .pop();

        Ok(latest.map_or(Latest::WaitAfter(current), Latest::Message))
    }
}

enum Latest {
    Message(Message),
    WaitAfter(u64),
}

/// A request waiting for a publish. Resolving consumes it, which releases
/// its registration exactly once.
struct PendingWait<'a, S>
where
    S: ChannelStore,
{
    channel: &'a Channel<S>,
    since: u64,
    registration: Registration<S>,
}

impl<S> PendingWait<'_, S>
where
    S: ChannelStore,
{
    async fn wait<E, D>(
        mut self,
        mut expired: Pin<&mut E>,
        mut disconnected: Pin<&mut D>,
    ) -> Result<Resolution, S::Error>
    where
        E: Future<Output = ()>,
        D: Future<Output = ()>,
    {
        // Covers publishes that landed while the subscription was opening.
        if let Some(batch) = self.read().await {
            return Ok(self.resolve(Resolution::Notified(batch)));
        }

        loop {
            tokio::select! {
                () = expired.as_mut() => return Ok(self.resolve(Resolution::TimedOut)),
                () = disconnected.as_mut() => return Ok(self.resolve(Resolution::Cancelled)),
                woken = self.registration.woken() => {
                    let Some(sequence) = woken else {
                        return Err(Error::SubscriptionClosed);
                    };

                    if let Some(batch) = self.read().await {
                        return Ok(self.resolve(Resolution::Notified(batch)));
                    }

                    debug!(key = %self.channel.key, since = self.since, sequence, "spurious wake-up");
                }
            }
        }
    }

    /// Failures are logged only; the next wake-up or the timeout follows.
    async fn read(&self) -> Option<Vec<Message>> {
        match self
            .channel
            .store
            .read_since(&self.channel.key, self.since)
            .await
        {
            Ok(history) => {
                let batch = accept(&self.channel.key, self.since, history);
                (!batch.is_empty()).then_some(batch)
            }
            Err(error) => {
                warn!(key = %self.channel.key, since = self.since, %error, "failed to read history after wake-up");
                None
            }
        }
    }

    fn resolve(self, resolution: Resolution) -> Resolution {
        let Self {
            channel,
            since,
            registration,
            ..
        } = self;
        registration.release();

        match &resolution {
            Resolution::Notified(batch) => {
                debug!(key = %channel.key, since, count = batch.len(), "resolved from notification");
            }
            Resolution::TimedOut => debug!(key = %channel.key, since, "timed out"),
            Resolution::Cancelled => debug!(key = %channel.key, since, "cancelled"),
            Resolution::History(_) => {}
        }

        resolution
    }
}

/// Keeps only messages after `since` in strictly increasing order.
fn accept(key: &str, since: u64, history: History) -> Vec<Message> {
    if history.is_truncated() {
        debug!(key, since, "history evicted past requested sequence, gap visible");
    }

    let mut last = since;
    history
        .into_messages()
        .into_iter()
        .filter(|message| {
            let fresh = message.sequence > last;
            if fresh {
                last = message.sequence;
            }
            fresh
        })
        .collect()
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

async fn disconnect(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since(None), Ok(None));
        assert_eq!(parse_since(Some("")), Ok(None));
        assert_eq!(parse_since(Some(" 42 ")), Ok(Some(42)));
        assert_eq!(parse_since(Some("0")), Ok(Some(0)));
        assert_eq!(
            parse_since(Some("-1")),
            Err(ProtocolError::InvalidSequence("-1".to_string()))
        );
        assert_eq!(
            parse_since(Some("abc")),
            Err(ProtocolError::InvalidSequence("abc".to_string()))
        );
    }

    #[test]
    fn test_accept_drops_stale_and_duplicate_sequences() {
        let history = History::Complete(vec![
            Message::new("a", 2),
            Message::new("b", 3),
            Message::new("b", 3),
            Message::new("c", 4),
        ]);

        let sequences: Vec<u64> = accept("test_key", 2, history)
            .into_iter()
            .map(|message| message.sequence)
            .collect();

        assert_eq!(sequences, vec![3, 4]);
    }

    #[test]
    fn test_accept_keeps_truncated_batch() {
        let history = History::Truncated(vec![Message::new("x", 90), Message::new("y", 91)]);

        assert_eq!(accept("test_key", 2, history).len(), 2);
    }
}

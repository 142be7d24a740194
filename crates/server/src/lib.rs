//! Ordered long-poll delivery on top of a channel store.
//!
//! A [`Channel`] answers "everything after sequence N" for one channel key,
//! from history when possible and otherwise by waiting for a publish. All
//! channels of a process share one [`Subscriber`], which keeps at most one
//! store subscription per key and fans its notifications out to the local
//! waiters registered in its [`MessageBuffer`]. Messages enter through a
//! [`Publisher`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;
mod error;
mod hooks;
mod message_buffer;
mod publisher;
mod subscriber;

pub use channel::{Channel, NextMessagesOptions, Resolution, parse_since};
pub use error::{Error, ProtocolError, Result};
pub use hooks::{ChannelHooks, NoopHooks, SubscribeParams};
pub use message_buffer::{MessageBuffer, Removal, Waiter, WaiterId};
pub use publisher::Publisher;
pub use subscriber::{Registration, Subscriber, SubscriberOptions, UNKNOWN_SEQUENCE};

pub use firehose_channel_store::{History, Message};

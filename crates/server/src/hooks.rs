use crate::Message;

use std::collections::HashMap;
use std::fmt::Debug;

/// Parameters a transport received along with a subscribe request.
pub type SubscribeParams = HashMap<String, String>;

/// Callbacks around the lifecycle of a [`Channel`](crate::Channel).
///
/// Every method defaults to doing nothing. Hooks run inline on the request
/// task and must not block.
pub trait ChannelHooks: Debug + Send + Sync + 'static {
    /// Called once when the channel is created.
    fn on_subscribe(&self, _key: &str, _params: &SubscribeParams) {}

    /// Called for every message a `next_messages` call delivers, oldest
    /// first.
    fn on_message(&self, _key: &str, _message: &Message) {}

    /// Called once when a `next_messages` call returns, whatever the
    /// outcome. Not called if the call's future is dropped.
    fn on_unsubscribe(&self, _key: &str) {}
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl ChannelHooks for NoopHooks {}

//! Broadcast transport abstraction.
//!
//! A transport delivers structured messages to every *other* binding of the
//! same named channel. Delivery is best-effort and unordered across senders;
//! a connection never assumes more than that.
//!
//! # Architecture
//!
//! - **BroadcastTransport**: opens bindings by channel name
//! - **ChannelBinding**: posts messages and hands out inboxes
//! - **Inbox**: async receiver for messages from other bindings
//! - **LocalBus**: in-process implementation used by tests and the demo

pub mod local;

pub use local::LocalBus;

use crate::Result;
use serde_json::Value;

/// A broadcast medium partitioned by channel name.
pub trait BroadcastTransport: Send + Sync + 'static {
    /// Open a binding on `channel_name`.
    fn bind(&self, channel_name: &str) -> Result<Box<dyn ChannelBinding>>;
}

/// One context's attachment to a named channel.
pub trait ChannelBinding: Send + Sync + 'static {
    /// Fan `message` out to every other binding on the channel.
    ///
    /// Returns `Ok` even when nobody is listening.
    fn post(&self, message: Value) -> Result<()>;

    /// Start receiving messages posted by other bindings from now on.
    fn subscribe(&self) -> Box<dyn Inbox>;

    fn channel_name(&self) -> &str;
}

#[async_trait::async_trait]
pub trait Inbox: Send + 'static {
    /// Wait for the next message. `None` once the channel is gone.
    async fn recv(&mut self) -> Option<Value>;
}

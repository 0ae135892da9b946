//! In-process broadcast bus.
//!
//! Each channel name maps to one `tokio::sync::broadcast` channel. Frames are
//! tagged with the posting binding's port id so receivers can skip their own
//! messages. A receiver that falls behind loses the overwritten frames, which
//! keeps delivery at-most-once like a real broadcast medium.

use super::{BroadcastTransport, ChannelBinding, Inbox};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
struct Frame {
    origin: u64,
    message: Value,
}

#[derive(Clone)]
struct ChannelState {
    tx: broadcast::Sender<Frame>,
    delivering: Arc<AtomicBool>,
}

struct BusInner {
    channels: Mutex<HashMap<String, ChannelState>>,
    next_port: AtomicU64,
    capacity: usize,
}

/// Shared in-process broadcast medium. Cloning yields another handle to the
/// same bus.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Frames buffered per channel before slow receivers start losing them.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: Mutex::new(HashMap::new()),
                next_port: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    fn channel(&self, name: &str) -> ChannelState {
        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.inner.capacity);
                ChannelState {
                    tx,
                    delivering: Arc::new(AtomicBool::new(true)),
                }
            })
            .clone()
    }

    /// Enable or disable delivery on a channel.
    ///
    /// While disabled, everything posted on the channel is discarded. Used to
    /// simulate contexts going silent without stopping them.
    pub fn set_delivery(&self, channel_name: &str, enabled: bool) {
        self.channel(channel_name)
            .delivering
            .store(enabled, Ordering::SeqCst);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl BroadcastTransport for LocalBus {
    fn bind(&self, channel_name: &str) -> Result<Box<dyn ChannelBinding>> {
        let state = self.channel(channel_name);
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        trace!("LocalBus bound port {} to {}", port, channel_name);
        Ok(Box::new(LocalBinding {
            port,
            channel_name: channel_name.to_string(),
            state,
        }))
    }
}

struct LocalBinding {
    port: u64,
    channel_name: String,
    state: ChannelState,
}

impl ChannelBinding for LocalBinding {
    fn post(&self, message: Value) -> Result<()> {
        if !self.state.delivering.load(Ordering::SeqCst) {
            trace!("Discarding message on muted channel {}", self.channel_name);
            return Ok(());
        }
        // An error only means there are no receivers right now.
        let _ = self.state.tx.send(Frame {
            origin: self.port,
            message,
        });
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn Inbox> {
        Box::new(LocalInbox {
            port: self.port,
            channel_name: self.channel_name.clone(),
            rx: self.state.tx.subscribe(),
        })
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

struct LocalInbox {
    port: u64,
    channel_name: String,
    rx: broadcast::Receiver<Frame>,
}

#[async_trait::async_trait]
impl Inbox for LocalInbox {
    async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.origin == self.port => continue,
                Ok(frame) => return Some(frame.message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        "Receiver on {} lagged, dropped {} messages",
                        self.channel_name, missed
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_to_other_bindings_only() {
        let bus = LocalBus::new();
        let a = bus.bind("tabs").unwrap();
        let b = bus.bind("tabs").unwrap();
        let mut a_inbox = a.subscribe();
        let mut b_inbox = b.subscribe();

        a.post(json!({"event": "x"})).unwrap();

        assert_eq!(b_inbox.recv().await, Some(json!({"event": "x"})));
        let own = tokio::time::timeout(Duration::from_millis(50), a_inbox.recv()).await;
        assert!(own.is_err(), "Sender must not receive its own message");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = LocalBus::new();
        let a = bus.bind("one").unwrap();
        let b = bus.bind("two").unwrap();
        let mut b_inbox = b.subscribe();

        a.post(json!({"event": "x"})).unwrap();

        let got = tokio::time::timeout(Duration::from_millis(50), b_inbox.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_post_without_receivers_is_ok() {
        let bus = LocalBus::new();
        let a = bus.bind("tabs").unwrap();
        assert!(a.post(json!({"event": "x"})).is_ok());
        assert_eq!(a.channel_name(), "tabs");
    }

    #[tokio::test]
    async fn test_muted_channel_discards() {
        let bus = LocalBus::new();
        let a = bus.bind("tabs").unwrap();
        let b = bus.bind("tabs").unwrap();
        let mut b_inbox = b.subscribe();

        bus.set_delivery("tabs", false);
        a.post(json!({"event": "lost"})).unwrap();
        bus.set_delivery("tabs", true);
        a.post(json!({"event": "kept"})).unwrap();

        assert_eq!(b_inbox.recv().await, Some(json!({"event": "kept"})));
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_and_continues() {
        let bus = LocalBus::with_capacity(2);
        let a = bus.bind("tabs").unwrap();
        let b = bus.bind("tabs").unwrap();
        let mut b_inbox = b.subscribe();

        for n in 0..5 {
            a.post(json!({"event": "n", "payload": n})).unwrap();
        }

        // Oldest frames were overwritten; the newest survive.
        assert_eq!(b_inbox.recv().await, Some(json!({"event": "n", "payload": 3})));
        assert_eq!(b_inbox.recv().await, Some(json!({"event": "n", "payload": 4})));
    }
}

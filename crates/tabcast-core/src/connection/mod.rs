//! Connection core.
//!
//! A [`Connection`] owns one transport binding, its instance identity, a local
//! [`EventRouter`], the live-peer table and the pending-request table. Roles
//! (see [`crate::role`]) attach extra timers and handlers to the same
//! start/stop lifecycle.
//!
//! # Thread Safety
//!
//! All mutable per-connection state sits behind one `std::sync::Mutex` that is
//! never held across an `.await` or while user handlers run. Spawned jobs hold
//! a `Weak` to the connection and the [`Epoch`] they were started in; any job
//! that wakes up after `stop()` sees a stale epoch and does nothing.

mod discovery;
mod inbound;
mod request;

pub use request::RequestOptions;

use crate::config::{event_key, ConnectionOptions, ProtocolConfig};
use crate::envelope::Envelope;
use crate::role::{self, Role};
use crate::router::{EventRouter, ListenerId};
use crate::timers::{Epoch, TimerKey, TimerSet};
use crate::transport::{BroadcastTransport, ChannelBinding};
use crate::{ConnectionError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{info, warn};

pub(crate) struct Inner {
    channel_name: String,
    instance_id: String,
    role: Role,
    options: ConnectionOptions,
    binding: Box<dyn ChannelBinding>,
    router: EventRouter,
    state: Mutex<State>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) epoch: Epoch,
    pub(crate) running: bool,
    pub(crate) connected: bool,
    /// Live peers and the lease number of their current liveness timer.
    pub(crate) peers: HashMap<String, u64>,
    pub(crate) next_lease: u64,
    pub(crate) pending: HashMap<String, request::PendingRequest>,
    pub(crate) timers: TimerSet,
    /// Router subscription installed by the role, removed on stop.
    pub(crate) role_listener: Option<(String, ListenerId)>,
}

impl State {
    pub(crate) fn is_current(&self, epoch: Epoch) -> bool {
        self.running && self.epoch == epoch
    }
}

/// Handle to a connection on a broadcast channel. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a builder for a connection on `channel_name`.
    pub fn builder(channel_name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(channel_name)
    }

    /// Plain peer connection with default options.
    pub fn new(channel_name: impl Into<String>, transport: &dyn BroadcastTransport) -> Result<Self> {
        Self::builder(channel_name).build(transport)
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        // Nothing panics while holding this lock except on allocation failure;
        // recover the guard rather than poisoning every later call.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.channel_name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Whether the last liveness ping found a responder.
    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// Instances currently believed live, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.lock_state().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Begin beaconing and handling inbound messages.
    ///
    /// Must be called from within a tokio runtime. Calling `start()` on a
    /// running connection does nothing.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if state.running {
            return;
        }
        state.running = true;
        state.epoch = state.epoch.next();
        let epoch = state.epoch;

        // Subscribe before the first beacon goes out so early replies land.
        let inbox = self.inner.binding.subscribe();
        state.timers.insert(
            TimerKey::Receiver,
            tokio::spawn(inbound::run(self.downgrade(), inbox, epoch)),
        );
        state.timers.insert(
            TimerKey::Beacon,
            tokio::spawn(discovery::beacon_loop(
                self.downgrade(),
                epoch,
                self.inner.options.beacon_interval,
            )),
        );

        match self.inner.role {
            Role::Peer => {}
            Role::Parent => role::parent::attach(self, epoch, &mut state),
            Role::Child => role::child::attach(self, epoch, &mut state),
        }

        info!(
            "Started {} connection {} on {}",
            self.inner.role, self.inner.instance_id, self.inner.channel_name
        );
    }

    /// Tear down every timer, forget peers and pending requests, detach the
    /// inbound handler. A stopped connection can be started again.
    ///
    /// `is_connected()` is left as it was; only a probe changes it.
    pub fn stop(&self) {
        let (pending, role_listener) = {
            let mut state = self.lock_state();
            if !state.running {
                return;
            }
            state.running = false;
            state.epoch = state.epoch.next();
            state.timers.cancel_all();
            state.peers.clear();
            (std::mem::take(&mut state.pending), state.role_listener.take())
        };

        // Dropping the reply senders fails every waiting request with `Cancelled`.
        drop(pending);
        if let Some((key, id)) = role_listener {
            self.inner.router.unsubscribe(&key, id);
        }

        info!(
            "Stopped {} connection {} on {}",
            self.inner.role, self.inner.instance_id, self.inner.channel_name
        );
    }

    /// Broadcast `<channel>.<event>` with `payload`. Fire-and-forget.
    pub fn emit(&self, channel: &str, event: &str, payload: impl Serialize) -> Result<()> {
        let envelope = Envelope::new(
            event_key(channel, event),
            self.inner.instance_id.clone(),
            serde_json::to_value(payload)?,
        );
        self.post(envelope)
    }

    pub(crate) fn post(&self, envelope: Envelope) -> Result<()> {
        self.inner.binding.post(envelope.into_value()?)
    }

    /// Post only if `epoch` is still the live lifecycle. Holds the state lock
    /// across the post so nothing goes out once `stop()` has returned.
    pub(crate) fn post_if_current(&self, epoch: Epoch, envelope: Envelope) -> bool {
        let value = match envelope.into_value() {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode envelope: {}", e);
                return true;
            }
        };
        let state = self.lock_state();
        if !state.is_current(epoch) {
            return false;
        }
        if let Err(e) = self.inner.binding.post(value) {
            warn!("Failed to post on {}: {}", self.inner.channel_name, e);
        }
        true
    }

    /// Subscribe `handler` to `<channel>.<event>` on the local router.
    pub fn on<F>(&self, channel: &str, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .router
            .subscribe(event_key(channel, event), Arc::new(handler))
    }

    /// Remove a subscription made with `on`, `on_request` or `once`.
    pub fn off(&self, channel: &str, event: &str, id: ListenerId) -> bool {
        self.inner.router.unsubscribe(&event_key(channel, event), id)
    }

    /// Subscribe to `<channel>.<event>.request`.
    pub fn on_request<F>(&self, channel: &str, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(
            channel,
            &format!("{}.{}", event, ProtocolConfig::REQUEST_SUFFIX),
            handler,
        )
    }

    /// Subscribe a handler that runs at most once, for the first payload
    /// accepted by `predicate`, then removes itself.
    pub fn once<P, F>(&self, channel: &str, event: &str, predicate: P, handler: F) -> ListenerId
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        F: FnOnce(&Value) + Send + 'static,
    {
        let key = event_key(channel, event);
        let weak = self.downgrade();
        // The id is known before the handler is installed, so an emit racing
        // this call can still remove it.
        let id = self.inner.router.reserve();
        let fired = AtomicBool::new(false);
        let handler = Mutex::new(Some(handler));

        let listener_key = key.clone();
        self.inner.router.subscribe_as(
            key,
            id,
            Arc::new(move |payload: &Value| {
                if !predicate(payload) || fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.router.unsubscribe(&listener_key, id);
                }
                let handler = handler
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(handler) = handler {
                    handler(payload);
                }
            }),
        );
        id
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel_name", &self.inner.channel_name)
            .field("instance_id", &self.inner.instance_id)
            .field("role", &self.inner.role)
            .finish()
    }
}

/// Builder for configuring a [`Connection`].
///
/// # Example
///
/// ```rust,ignore
/// use tabcast_core::{Connection, LocalBus, Role};
///
/// let bus = LocalBus::new();
/// let child = Connection::builder("my-app")
///     .role(Role::Child)
///     .ping_timeout(Duration::from_millis(250))
///     .build(&bus)?;
/// child.start();
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    channel_name: String,
    instance_id: Option<String>,
    role: Role,
    options: ConnectionOptions,
}

impl ConnectionBuilder {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            instance_id: None,
            role: Role::Peer,
            options: ConnectionOptions::default(),
        }
    }

    /// Use a fixed identity instead of a generated UUID.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Default: [`Role::Peer`]
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Replace every timing option at once.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn beacon_interval(mut self, interval: std::time::Duration) -> Self {
        self.options.beacon_interval = interval;
        self
    }

    pub fn peer_liveness_window(mut self, window: std::time::Duration) -> Self {
        self.options.peer_liveness_window = window;
        self
    }

    pub fn fast_probe_interval(mut self, interval: std::time::Duration) -> Self {
        self.options.fast_probe_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    pub fn ping_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.ping_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Validate the options and bind to `channel_name` on `transport`.
    pub fn build(self, transport: &dyn BroadcastTransport) -> Result<Connection> {
        if self.channel_name.is_empty() {
            return Err(ConnectionError::Config {
                message: "channel name must not be empty".to_string(),
            });
        }
        if self.instance_id.as_deref() == Some("") {
            return Err(ConnectionError::Config {
                message: "instance id must not be empty".to_string(),
            });
        }
        self.options.validate()?;

        let binding = transport.bind(&self.channel_name)?;
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Connection {
            inner: Arc::new(Inner {
                channel_name: self.channel_name,
                instance_id,
                role: self.role,
                options: self.options,
                binding,
                router: EventRouter::new(),
                state: Mutex::new(State::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_builder_generates_identity() {
        let bus = LocalBus::new();
        let a = Connection::new("tabs", &bus).unwrap();
        let b = Connection::new("tabs", &bus).unwrap();

        assert!(!a.instance_id().is_empty());
        assert_ne!(a.instance_id(), b.instance_id());
        assert_eq!(a.role(), Role::Peer);
        assert_eq!(a.channel_name(), "tabs");
    }

    #[test]
    fn test_builder_identity_override() {
        let bus = LocalBus::new();
        let conn = Connection::builder("tabs")
            .instance_id("tab-7")
            .build(&bus)
            .unwrap();
        assert_eq!(conn.instance_id(), "tab-7");
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let bus = LocalBus::new();
        assert!(matches!(
            Connection::builder("").build(&bus),
            Err(ConnectionError::Config { .. })
        ));
        assert!(Connection::builder("tabs").instance_id("").build(&bus).is_err());
        assert!(Connection::builder("tabs")
            .beacon_interval(Duration::from_secs(5))
            .build(&bus)
            .is_err());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let bus = LocalBus::new();
        let conn = Connection::new("tabs", &bus).unwrap();
        conn.stop();
        assert!(!conn.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_lifecycle() {
        let bus = LocalBus::new();
        let conn = Connection::new("tabs", &bus).unwrap();
        conn.start();
        let epoch = conn.lock_state().epoch;
        conn.start();
        assert_eq!(conn.lock_state().epoch, epoch);
        assert!(conn.is_running());
        conn.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_reaches_remote_subscriber() {
        let bus = LocalBus::new();
        let sender = Connection::new("tabs", &bus).unwrap();
        let receiver = Connection::new("tabs", &bus).unwrap();
        receiver.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        receiver.on("app", "greet", move |payload| {
            s.lock().unwrap().push(payload.clone());
        });

        sender.emit("app", "greet", json!({"hello": "world"})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"hello": "world"})]);
        receiver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_stops_delivery() {
        let bus = LocalBus::new();
        let sender = Connection::new("tabs", &bus).unwrap();
        let receiver = Connection::new("tabs", &bus).unwrap();
        receiver.start();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = receiver.on("app", "tick", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sender.emit("app", "tick", ()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(receiver.off("app", "tick", id));
        sender.emit("app", "tick", ()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        receiver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_for_first_accepted_payload_only() {
        let bus = LocalBus::new();
        let sender = Connection::new("tabs", &bus).unwrap();
        let receiver = Connection::new("tabs", &bus).unwrap();
        receiver.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        receiver.once(
            "app",
            "n",
            |payload| payload.as_i64().map(|n| n > 1).unwrap_or(false),
            move |payload| s.lock().unwrap().push(payload.clone()),
        );

        for n in 0..5 {
            sender.emit("app", "n", n).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
        assert_eq!(receiver.router().listener_count("app.n"), 0);
        receiver.stop();
    }

    #[test]
    fn test_once_removes_itself_under_concurrent_emits() {
        let bus = LocalBus::new();
        let conn = Connection::new("tabs", &bus).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let emitter = {
            let conn = conn.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    conn.router().emit("app.n", &json!(1));
                }
            })
        };

        for _ in 0..200 {
            let calls = Arc::new(AtomicUsize::new(0));
            let c = calls.clone();
            conn.once("app", "n", |_| true, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            while calls.load(Ordering::SeqCst) == 0 {
                std::thread::yield_now();
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
        stop.store(true, Ordering::SeqCst);
        emitter.join().unwrap();

        assert_eq!(conn.router().listener_count("app.n"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_connection_ignores_inbound() {
        let bus = LocalBus::new();
        let sender = Connection::new("tabs", &bus).unwrap();
        let receiver = Connection::new("tabs", &bus).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        receiver.on("app", "tick", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        receiver.start();
        receiver.stop();
        sender.emit("app", "tick", ()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

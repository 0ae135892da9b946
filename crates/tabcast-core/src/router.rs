//! Local event router.
//!
//! String-keyed, one-to-many, synchronous fan-out. Handlers are invoked
//! outside the router lock, so a handler may subscribe, unsubscribe or emit
//! from inside its own callback.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback invoked with the payload of a routed event.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

/// Identifies one subscription, returned by `subscribe` and used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventRouter {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, Handler)>>> {
        // A panicking handler never runs under this lock, so poisoning only
        // means another thread panicked mid-insert; the map is still usable.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, key: impl Into<String>, handler: Handler) -> ListenerId {
        let id = self.reserve();
        self.subscribe_as(key, id, handler);
        id
    }

    /// Allocate an id for a handler that needs to know it before it is installed.
    pub(crate) fn reserve(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Install `handler` under an id obtained from `reserve`.
    pub(crate) fn subscribe_as(&self, key: impl Into<String>, id: ListenerId, handler: Handler) {
        self.lock().entry(key.into()).or_default().push((id, handler));
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, key: &str, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(handlers) = listeners.get_mut(key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(key);
        }
        removed
    }

    /// Deliver `payload` to every current subscriber of `key`.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, key: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = match self.lock().get(key) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.lock().get(key).map(Vec::len).unwrap_or(0)
    }

    /// Remove every subscription on every key.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("EventRouter").field("keys", &keys).finish()
    }
}

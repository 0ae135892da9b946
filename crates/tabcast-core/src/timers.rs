//! Owned timer bookkeeping for a connection.
//!
//! Every periodic or delayed job a connection runs is a spawned tokio task
//! registered here under a [`TimerKey`]. Cancelling a key aborts its task;
//! dropping the set aborts everything it still holds.
//!
//! Aborting alone does not stop a task that is already mid-poll on another
//! worker thread, so each job also carries the [`Epoch`] it was started in and
//! re-checks it under the connection lock before acting.

use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Lifecycle generation of a connection. Bumped by every `start()` and `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0.wrapping_add(1))
    }
}

/// Named slots for the long-lived jobs of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Periodic `discovery.online` broadcast.
    Beacon,
    /// Inbound message loop.
    Receiver,
    /// Child: rapid pings until the first connect.
    FastProbe,
    /// Child: steady pings once connected.
    Heartbeat,
    /// Liveness lease for one peer.
    PeerLease(String),
}

#[derive(Debug, Default)]
pub struct TimerSet {
    handles: HashMap<TimerKey, JoinHandle<()>>,
}

impl TimerSet {
    /// Register `handle` under `key`, aborting whatever held the key before.
    pub fn insert(&mut self, key: TimerKey, handle: JoinHandle<()>) {
        if let Some(previous) = self.handles.insert(key, handle) {
            previous.abort();
        }
    }

    /// Abort the job under `key`. Returns false if there was none.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.handles.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget `key` without aborting it, for a job that is finishing itself.
    pub fn release(&mut self, key: &TimerKey) {
        self.handles.remove(key);
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.handles.contains_key(key)
    }

    /// Abort every registered job.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

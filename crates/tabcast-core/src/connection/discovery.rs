//! Heartbeat-based peer discovery.
//!
//! Every running connection broadcasts `discovery.online` immediately and
//! then once per beacon interval. Receivers keep a lease per peer; each beacon
//! replaces the lease timer, and a lease that runs out removes the peer.

use super::{Connection, Inner};
use crate::envelope::Envelope;
use crate::timers::{Epoch, TimerKey};
use std::sync::Weak;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

pub(super) async fn beacon_loop(weak: Weak<Inner>, epoch: Epoch, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        let beacon = Envelope::beacon(conn.instance_id());
        if !conn.post_if_current(epoch, beacon) {
            return;
        }
    }
}

impl Connection {
    /// Record a beacon from `instance`, (re)starting its liveness lease.
    pub(super) fn renew_peer(&self, epoch: Epoch, instance: String) {
        if instance == self.instance_id() {
            trace!("Ignoring beacon carrying our own identity {}", instance);
            return;
        }

        let window = self.options().peer_liveness_window;
        let mut state = self.lock_state();
        if !state.is_current(epoch) {
            return;
        }

        state.next_lease += 1;
        let lease = state.next_lease;
        if state.peers.insert(instance.clone(), lease).is_none() {
            debug!("{} discovered peer {}", self.instance_id(), instance);
        }

        let handle = tokio::spawn(expire_peer(self.downgrade(), epoch, instance.clone(), lease, window));
        state.timers.insert(TimerKey::PeerLease(instance), handle);
    }
}

async fn expire_peer(weak: Weak<Inner>, epoch: Epoch, instance: String, lease: u64, window: Duration) {
    tokio::time::sleep(window).await;

    let Some(conn) = Connection::upgrade(&weak) else {
        return;
    };
    let mut state = conn.lock_state();
    if !state.is_current(epoch) || state.peers.get(&instance) != Some(&lease) {
        return;
    }
    state.peers.remove(&instance);
    state.timers.release(&TimerKey::PeerLease(instance.clone()));
    debug!("{} lost peer {}", conn.instance_id(), instance);
}

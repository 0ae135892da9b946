//! Child role: latch onto the parent as fast as possible, then heartbeat.

use crate::connection::{Connection, Inner, State};
use crate::timers::{Epoch, TimerKey};
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Start fast probing. The first probe fires immediately, even when the
/// connection is still marked connected from before a restart.
pub(crate) fn attach(conn: &Connection, epoch: Epoch, state: &mut State) {
    let period = conn.options().fast_probe_interval;
    state.timers.insert(
        TimerKey::FastProbe,
        tokio::spawn(fast_probe(conn.downgrade(), epoch, period)),
    );
}

/// Called under the state lock after every successful probe. Idempotent.
pub(crate) fn enter_steady_state(conn: &Connection, epoch: Epoch, state: &mut State) {
    if state.timers.cancel(&TimerKey::FastProbe) {
        debug!("{} connected, fast probing stopped", conn.instance_id());
    }
    if state.timers.contains(&TimerKey::Heartbeat) {
        return;
    }
    let period = conn.options().heartbeat_interval;
    state.timers.insert(
        TimerKey::Heartbeat,
        tokio::spawn(heartbeat(conn.downgrade(), epoch, period)),
    );
}

async fn fast_probe(weak: Weak<Inner>, epoch: Epoch, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut first = true;

    loop {
        interval.tick().await;
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        if !first && conn.is_connected() {
            continue;
        }
        first = false;
        if !conn.spawn_probe(epoch) {
            return;
        }
    }
}

async fn heartbeat(weak: Weak<Inner>, epoch: Epoch, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        if !conn.spawn_probe(epoch) {
            return;
        }
    }
}

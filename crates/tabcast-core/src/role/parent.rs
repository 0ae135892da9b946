//! Parent role: the authoritative liveness responder.

use crate::config::{event_key, ProtocolConfig};
use crate::connection::{Connection, State};
use crate::envelope::RequestBody;
use crate::timers::Epoch;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Install the standing `connection.ping.request` responder for `epoch`.
pub(crate) fn attach(conn: &Connection, epoch: Epoch, state: &mut State) {
    let key = event_key(
        ProtocolConfig::CONNECTION_CHANNEL,
        &format!("{}.{}", ProtocolConfig::PING_EVENT, ProtocolConfig::REQUEST_SUFFIX),
    );
    let weak = conn.downgrade();

    let id = conn.router().subscribe(
        key.clone(),
        Arc::new(move |payload: &Value| {
            if let Some(conn) = Connection::upgrade(&weak) {
                answer_ping(&conn, epoch, payload);
            }
        }),
    );
    state.role_listener = Some((key, id));
}

/// Reply to one ping. Nothing is posted once `epoch` has been stopped.
fn answer_ping(conn: &Connection, epoch: Epoch, payload: &Value) -> bool {
    let Ok(body) = serde_json::from_value::<RequestBody>(payload.clone()) else {
        return false;
    };
    match conn.response_envelope(
        ProtocolConfig::CONNECTION_CHANNEL,
        ProtocolConfig::PING_EVENT,
        &body.id,
        json!({}),
    ) {
        Ok(envelope) => conn.post_if_current(epoch, envelope),
        Err(e) => {
            warn!("Failed to answer ping {}: {}", body.id, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;
    use crate::transport::{BroadcastTransport, ChannelBinding, Inbox, LocalBus};
    use std::time::Duration;

    async fn drain(inbox: &mut Box<dyn Inbox>) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(10), inbox.recv()).await
        {
            seen.push(message);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answer_is_not_sent_for_a_stopped_lifecycle() {
        let bus = LocalBus::new();
        let parent = Connection::builder("tabs")
            .instance_id("parent")
            .role(Role::Parent)
            .build(&bus)
            .unwrap();
        let mut inbox = bus.bind("tabs").unwrap().subscribe();

        parent.start();
        let epoch = parent.lock_state().epoch;
        let request = json!({"id": "ping-1"});
        assert!(answer_ping(&parent, epoch, &request));

        // A handler invocation that passed its epoch check just before stop().
        parent.stop();
        assert!(!answer_ping(&parent, epoch, &request));

        let replies: Vec<Value> = drain(&mut inbox)
            .await
            .into_iter()
            .filter(|m| m["event"] == "connection.ping.response")
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["payload"], json!({"id": "ping-1", "data": {}}));
        assert_eq!(replies[0]["instance"], "parent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_without_id_is_ignored() {
        let bus = LocalBus::new();
        let parent = Connection::builder("tabs").role(Role::Parent).build(&bus).unwrap();
        parent.start();
        let epoch = parent.lock_state().epoch;

        assert!(!answer_ping(&parent, epoch, &json!({"data": 1})));
        parent.stop();
    }
}

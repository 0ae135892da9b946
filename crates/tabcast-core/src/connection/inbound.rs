//! Inbound message handling.

use super::{Connection, Inner};
use crate::envelope::{Delivery, Message};
use crate::timers::Epoch;
use crate::transport::Inbox;
use serde_json::Value;
use std::sync::Weak;
use tracing::{debug, trace};

pub(super) async fn run(weak: Weak<Inner>, mut inbox: Box<dyn Inbox>, epoch: Epoch) {
    while let Some(raw) = inbox.recv().await {
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        if !conn.handle_inbound(epoch, raw) {
            return;
        }
    }
    debug!("Inbound channel closed");
}

impl Connection {
    /// Process one received message. Returns false once `epoch` is stale.
    pub(super) fn handle_inbound(&self, epoch: Epoch, raw: Value) -> bool {
        if !self.lock_state().is_current(epoch) {
            return false;
        }

        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                trace!("Dropping inbound message on {}: {}", self.channel_name(), e);
                return true;
            }
        };

        match message {
            Message::Beacon { instance } => self.renew_peer(epoch, instance),
            Message::Event(delivery) | Message::Request(delivery, _) => {
                self.route(&delivery);
            }
            Message::Response(delivery, body) => {
                if self.route(&delivery) {
                    self.resolve_pending(&delivery.event, body);
                }
            }
        }
        true
    }

    /// Hand a delivery to the local router unless it targets someone else.
    fn route(&self, delivery: &Delivery) -> bool {
        if !delivery.is_addressed_to(self.instance_id()) {
            trace!(
                "Dropping {} addressed to {:?}",
                delivery.event,
                delivery.target()
            );
            return false;
        }
        self.router().emit(&delivery.event, &delivery.payload);
        true
    }
}

//! Correlated request/response and liveness pings.
//!
//! Each `request()` registers a [`PendingRequest`] under a fresh correlation
//! id, broadcasts `<channel>.<event>.request` and waits. The first
//! `<channel>.<event>.response` carrying the same id wins; the entry is
//! removed exactly once, either by that response or by the deadline.

use super::Connection;
use crate::config::{event_key, ProtocolConfig};
use crate::envelope::{Envelope, RequestBody, ResponseBody};
use crate::role::{self, Role};
use crate::timers::Epoch;
use crate::{ConnectionError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub(crate) struct PendingRequest {
    /// Full response event name the reply must arrive on.
    response_event: String,
    reply: oneshot::Sender<Value>,
}

/// Per-call overrides for [`Connection::request_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Falls back to the connection's `request_timeout`.
    pub timeout: Option<Duration>,
    /// Address the request to one instance instead of every listener.
    pub target: Option<String>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_target(mut self, instance_id: impl Into<String>) -> Self {
        self.target = Some(instance_id.into());
        self
    }
}

/// Removes the pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.lock_state().pending.remove(&self.id);
    }
}

impl Connection {
    /// Request `<channel>.<event>` from whoever answers first, using the
    /// default request timeout.
    pub async fn request(&self, channel: &str, event: &str, payload: impl Serialize) -> Result<Value> {
        self.request_with(channel, event, payload, RequestOptions::default())
            .await
    }

    /// Request with an explicit timeout and/or target instance.
    ///
    /// Resolves with the `data` of the first matching response, or fails with
    /// `Timeout` once the deadline passes. Fails with `Cancelled` if the
    /// connection is stopped while waiting.
    pub async fn request_with(
        &self,
        channel: &str,
        event: &str,
        payload: impl Serialize,
        options: RequestOptions,
    ) -> Result<Value> {
        let data = serde_json::to_value(payload)?;
        self.send_request(channel, event, data, options, None).await
    }

    pub(crate) async fn send_request(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        options: RequestOptions,
        gate: Option<Epoch>,
    ) -> Result<Value> {
        let timeout = options.timeout.unwrap_or(self.options().request_timeout);
        let request_event = event_key(channel, event);
        let id = uuid::Uuid::new_v4().to_string();

        let (reply, mut rx) = oneshot::channel();
        self.lock_state().pending.insert(
            id.clone(),
            PendingRequest {
                response_event: format!("{}.{}", request_event, ProtocolConfig::RESPONSE_SUFFIX),
                reply,
            },
        );
        let guard = PendingGuard {
            conn: self,
            id: id.clone(),
        };

        let body = RequestBody {
            id: id.clone(),
            data,
            target: options.target,
        };
        let envelope = Envelope::new(
            format!("{}.{}", request_event, ProtocolConfig::REQUEST_SUFFIX),
            self.instance_id().to_string(),
            serde_json::to_value(body)?,
        );
        match gate {
            Some(epoch) => {
                if !self.post_if_current(epoch, envelope) {
                    return Err(ConnectionError::Cancelled {
                        event: request_event,
                    });
                }
            }
            None => self.post(envelope)?,
        }

        let waited = tokio::time::timeout(timeout, &mut rx).await;
        let outcome = match waited {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(ConnectionError::Cancelled {
                event: request_event,
            }),
            Err(_) => {
                let expired = self.lock_state().pending.remove(&id).is_some();
                if expired {
                    debug!("Request {} ({}) timed out after {:?}", request_event, id, timeout);
                    Err(ConnectionError::Timeout {
                        event: request_event,
                        after: timeout,
                    })
                } else {
                    // The reply won the race against the deadline.
                    rx.try_recv().map_err(|_| ConnectionError::Cancelled {
                        event: request_event,
                    })
                }
            }
        };
        drop(guard);
        outcome
    }

    /// Answer a request previously received on `<channel>.<event>.request`.
    pub fn respond(&self, channel: &str, event: &str, id: &str, payload: impl Serialize) -> Result<()> {
        let envelope = self.response_envelope(channel, event, id, serde_json::to_value(payload)?)?;
        self.post(envelope)
    }

    pub(crate) fn response_envelope(
        &self,
        channel: &str,
        event: &str,
        id: &str,
        data: Value,
    ) -> Result<Envelope> {
        let body = ResponseBody {
            id: id.to_string(),
            data,
        };
        Ok(Envelope::new(
            event_key(channel, &format!("{}.{}", event, ProtocolConfig::RESPONSE_SUFFIX)),
            self.instance_id().to_string(),
            serde_json::to_value(body)?,
        ))
    }

    /// Complete the pending request owning `body.id`, if it listens on `event`.
    pub(super) fn resolve_pending(&self, event: &str, body: ResponseBody) {
        let mut state = self.lock_state();
        let matches = state
            .pending
            .get(&body.id)
            .map(|pending| pending.response_event == event)
            .unwrap_or(false);
        if !matches {
            return;
        }
        if let Some(pending) = state.pending.remove(&body.id) {
            // The requester may have given up already; nothing to do then.
            let _ = pending.reply.send(body.data);
        }
    }

    /// Probe for a responder on `connection.ping` and update `connected`.
    ///
    /// Returns whether a reply arrived. `connection.online` and
    /// `connection.offline` are emitted only when the state flips.
    pub async fn ping(&self) -> bool {
        let epoch = self.lock_state().epoch;
        self.probe(epoch).await
    }

    pub(crate) async fn probe(&self, epoch: Epoch) -> bool {
        let options = RequestOptions::default().with_timeout(self.options().ping_timeout);
        let data = json!({ "id": uuid::Uuid::new_v4().to_string() });
        let result = self
            .send_request(
                ProtocolConfig::CONNECTION_CHANNEL,
                ProtocolConfig::PING_EVENT,
                data,
                options,
                Some(epoch),
            )
            .await;

        match result {
            Ok(_) => {
                self.apply_probe_result(epoch, true);
                true
            }
            Err(e) if e.is_timeout() => {
                self.apply_probe_result(epoch, false);
                false
            }
            Err(e) => {
                debug!("Ping abandoned: {}", e);
                false
            }
        }
    }

    /// Spawn a probe for `epoch`. Returns false once `epoch` is stale.
    pub(crate) fn spawn_probe(&self, epoch: Epoch) -> bool {
        if !self.lock_state().is_current(epoch) {
            return false;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            conn.probe(epoch).await;
        });
        true
    }

    fn apply_probe_result(&self, epoch: Epoch, reachable: bool) {
        let transition = {
            let mut state = self.lock_state();
            if !state.is_current(epoch) {
                return;
            }
            if reachable && self.role() == Role::Child {
                role::child::enter_steady_state(self, epoch, &mut state);
            }
            match (reachable, state.connected) {
                (true, false) => {
                    state.connected = true;
                    Some(ProtocolConfig::ONLINE_EVENT)
                }
                (false, true) => {
                    state.connected = false;
                    Some(ProtocolConfig::OFFLINE_EVENT)
                }
                _ => None,
            }
        };

        if let Some(event) = transition {
            info!("{} is now {}", self.instance_id(), event);
            self.router()
                .emit(&event_key(ProtocolConfig::CONNECTION_CHANNEL, event), &json!({}));
        }
    }
}

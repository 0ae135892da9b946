//! Centralized configuration for tabcast.
//!
//! Protocol defaults and reserved event names live on [`ProtocolConfig`];
//! per-connection overrides are carried by [`ConnectionOptions`].

use crate::{ConnectionError, Result};
use std::time::Duration;

/// Protocol-level constants shared by every connection on a channel.
pub struct ProtocolConfig;

impl ProtocolConfig {
    // Discovery
    pub const BEACON_INTERVAL: Duration = Duration::from_millis(1000);
    pub const PEER_LIVENESS_WINDOW: Duration = Duration::from_millis(2000);

    // Child probing
    pub const FAST_PROBE_INTERVAL: Duration = Duration::from_millis(500);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

    // Request timeouts
    pub const PING_TIMEOUT: Duration = Duration::from_millis(500);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

    // Reserved channels and events
    pub const DISCOVERY_CHANNEL: &'static str = "discovery";
    pub const CONNECTION_CHANNEL: &'static str = "connection";
    pub const ONLINE_EVENT: &'static str = "online";
    pub const OFFLINE_EVENT: &'static str = "offline";
    pub const PING_EVENT: &'static str = "ping";

    // Envelope suffixes
    pub const REQUEST_SUFFIX: &'static str = "request";
    pub const RESPONSE_SUFFIX: &'static str = "response";
}

/// Timing options for a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// How often this instance announces itself on `discovery.online`.
    pub beacon_interval: Duration,
    /// How long a peer stays known without a fresh beacon.
    pub peer_liveness_window: Duration,
    /// Child only: probe cadence until the first successful ping.
    pub fast_probe_interval: Duration,
    /// Child only: probe cadence once connected.
    pub heartbeat_interval: Duration,
    /// Deadline for each liveness ping.
    pub ping_timeout: Duration,
    /// Default deadline for `request()`.
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            beacon_interval: ProtocolConfig::BEACON_INTERVAL,
            peer_liveness_window: ProtocolConfig::PEER_LIVENESS_WINDOW,
            fast_probe_interval: ProtocolConfig::FAST_PROBE_INTERVAL,
            heartbeat_interval: ProtocolConfig::HEARTBEAT_INTERVAL,
            ping_timeout: ProtocolConfig::PING_TIMEOUT,
            request_timeout: ProtocolConfig::REQUEST_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    /// Reject option sets that would make the protocol misbehave.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("beacon_interval", self.beacon_interval),
            ("peer_liveness_window", self.peer_liveness_window),
            ("fast_probe_interval", self.fast_probe_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("ping_timeout", self.ping_timeout),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConnectionError::Config {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        // Every live peer would flap between beacons otherwise.
        if self.peer_liveness_window <= self.beacon_interval {
            return Err(ConnectionError::Config {
                message: format!(
                    "peer_liveness_window ({:?}) must exceed beacon_interval ({:?})",
                    self.peer_liveness_window, self.beacon_interval
                ),
            });
        }

        Ok(())
    }
}

/// Join a channel and an event into the dotted name used on the wire.
pub fn event_key(channel: &str, event: &str) -> String {
    format!("{}.{}", channel, event)
}

//! Runtime settings for the realtime layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every component.
///
/// Durations are expressed in whole seconds or milliseconds so the struct can
/// be filled from flags, environment or a JSON document alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum snapshot age before an agent is reported offline.
    pub freshness_ttl_secs: u64,
    /// Period of keepalive events on subscriber streams.
    pub heartbeat_interval_secs: u64,
    /// Period of the poll task reconciliation pass.
    pub reconcile_interval_secs: u64,
    /// Timeout of a single metrics pull.
    pub poll_timeout_ms: u64,
    /// Poll interval for agents that do not configure one.
    pub default_poll_interval_ms: u64,
    /// Port used for agents that do not advertise one.
    pub default_agent_port: u16,
    /// Default deadline for a command round-trip.
    pub command_timeout_secs: u64,
    /// Lifetime of a subscriber stream.
    pub subscriber_timeout_secs: u64,
    /// Events buffered per subscriber before it is considered dead.
    pub sink_capacity: usize,
    /// Samples kept per agent by the in-memory store.
    pub history_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            freshness_ttl_secs: 60,
            heartbeat_interval_secs: 30,
            reconcile_interval_secs: 30,
            poll_timeout_ms: 3_000,
            default_poll_interval_ms: 1_000,
            default_agent_port: 9090,
            command_timeout_secs: 30,
            subscriber_timeout_secs: 60 * 60,
            sink_capacity: 256,
            history_limit: 1_000,
        }
    }
}

impl Settings {
    #[must_use]
    pub const fn freshness_ttl(&self) -> Duration {
        Duration::from_secs(self.freshness_ttl_secs)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub const fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub const fn subscriber_timeout(&self) -> Duration {
        Duration::from_secs(self.subscriber_timeout_secs)
    }
}

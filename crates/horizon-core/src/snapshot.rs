//! Realtime snapshot shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, AgentIdentity, MetricsSample};

/// Latest known metrics for one agent.
///
/// Metric fields are `None` whenever the agent is reported offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeSnapshot {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub agent_ip: String,
    pub online: bool,

    pub cpu_usage: Option<f64>,
    pub memory_total: Option<u64>,
    pub memory_used: Option<u64>,
    pub memory_usage: Option<f64>,
    pub disk_total: Option<u64>,
    pub disk_used: Option<u64>,
    pub disk_usage: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
    pub network_rx_rate: Option<f64>,
    pub network_tx_rate: Option<f64>,
    pub load_average_1m: Option<f64>,
    pub load_average_5m: Option<f64>,
    pub load_average_15m: Option<f64>,
    pub process_count: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub temperature: Option<f64>,

    pub observed_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl RealtimeSnapshot {
    /// Fresh online snapshot built from a sample.
    #[must_use]
    pub fn online(identity: &AgentIdentity, sample: &MetricsSample, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: identity.id,
            agent_name: identity.name.clone(),
            agent_ip: identity.address.clone(),
            online: true,
            cpu_usage: Some(sample.cpu_usage),
            memory_total: Some(sample.memory_total),
            memory_used: Some(sample.memory_used),
            memory_usage: Some(sample.memory_usage()),
            disk_total: Some(sample.disk_total),
            disk_used: Some(sample.disk_used),
            disk_usage: Some(sample.disk_usage()),
            network_rx_bytes: Some(sample.network_rx_bytes),
            network_tx_bytes: Some(sample.network_tx_bytes),
            network_rx_rate: Some(sample.network_rx_rate),
            network_tx_rate: Some(sample.network_tx_rate),
            load_average_1m: sample.load_average_1m,
            load_average_5m: sample.load_average_5m,
            load_average_15m: sample.load_average_15m,
            process_count: sample.process_count,
            uptime_seconds: sample.uptime_seconds,
            temperature: sample.temperature,
            observed_at: now,
            last_heartbeat: Some(now),
        }
    }

    /// Offline snapshot carrying only identity fields.
    #[must_use]
    pub fn offline(identity: &AgentIdentity, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: identity.id,
            agent_name: identity.name.clone(),
            agent_ip: identity.address.clone(),
            online: false,
            cpu_usage: None,
            memory_total: None,
            memory_used: None,
            memory_usage: None,
            disk_total: None,
            disk_used: None,
            disk_usage: None,
            network_rx_bytes: None,
            network_tx_bytes: None,
            network_rx_rate: None,
            network_tx_rate: None,
            load_average_1m: None,
            load_average_5m: None,
            load_average_15m: None,
            process_count: None,
            uptime_seconds: None,
            temperature: None,
            observed_at: now,
            last_heartbeat: None,
        }
    }

    /// Stale copy of this snapshot: offline, metrics blanked, last heartbeat kept.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> Self {
        let identity = AgentIdentity::new(self.agent_id, &self.agent_name, &self.agent_ip);
        Self {
            last_heartbeat: self.last_heartbeat,
            ..Self::offline(&identity, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_derives_percentages() {
        let identity = AgentIdentity::new(1, "web-1", "10.0.0.1");
        let sample = MetricsSample {
            cpu_usage: 50.0,
            memory_total: 1000,
            memory_used: 250,
            ..MetricsSample::default()
        };
        let snap = RealtimeSnapshot::online(&identity, &sample, Utc::now());

        assert!(snap.online);
        assert_eq!(snap.memory_usage, Some(25.0));
        assert_eq!(snap.disk_usage, Some(0.0));
        assert_eq!(snap.last_heartbeat, Some(snap.observed_at));
    }

    #[test]
    fn test_expired_blanks_metrics() {
        let identity = AgentIdentity::new(1, "web-1", "10.0.0.1");
        let sample = MetricsSample {
            cpu_usage: 10.0,
            ..MetricsSample::default()
        };
        let seen = Utc::now();
        let snap = RealtimeSnapshot::online(&identity, &sample, seen).expired(Utc::now());

        assert!(!snap.online);
        assert_eq!(snap.cpu_usage, None);
        assert_eq!(snap.agent_name, "web-1");
        assert_eq!(snap.last_heartbeat, Some(seen));
    }

    #[test]
    fn test_serializes_camel_case() {
        let identity = AgentIdentity::new(7, "db", "10.0.0.7");
        let json = serde_json::to_value(RealtimeSnapshot::offline(&identity, Utc::now())).unwrap();
        assert_eq!(json["agentId"], 7);
        assert_eq!(json["online"], false);
        assert!(json["memoryUsage"].is_null());
        assert!(json.get("observedAt").is_some());
    }
}

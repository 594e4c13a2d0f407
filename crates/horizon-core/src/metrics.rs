//! Metrics payloads and normalization.

use serde::{Deserialize, Serialize};

/// Normalized metrics sample, the common shape for pushed and polled data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSample {
    pub cpu_usage: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub network_rx_rate: f64,
    pub network_tx_rate: f64,
    pub load_average_1m: Option<f64>,
    pub load_average_5m: Option<f64>,
    pub load_average_15m: Option<f64>,
    pub process_count: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub temperature: Option<f64>,
}

impl MetricsSample {
    /// Memory usage percentage.
    #[must_use]
    pub fn memory_usage(&self) -> f64 {
        percentage(self.memory_used, self.memory_total)
    }

    /// Disk usage percentage.
    #[must_use]
    pub fn disk_usage(&self) -> f64 {
        percentage(self.disk_used, self.disk_total)
    }
}

/// `used / total` as a percentage rounded to two decimals, `0.0` when `total` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Raw report as produced by an agent, either pushed or served on `/metrics`.
///
/// Pushing agents and the polled endpoint disagree on a few field names,
/// both spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentReport {
    pub node_id: Option<String>,
    pub os: Option<String>,
    pub platform: Option<String>,
    #[serde(alias = "cpu")]
    pub cpu_usage: Option<f64>,
    #[serde(alias = "temp")]
    pub temperature: Option<f64>,
    pub mem_usage: Option<f64>,
    #[serde(alias = "memTotalBytes")]
    pub memory_total: Option<u64>,
    #[serde(alias = "memUsedBytes")]
    pub memory_used: Option<u64>,
    pub disks: Option<Vec<DiskReport>>,
    pub interfaces: Option<Vec<InterfaceReport>>,
    pub uptime_seconds: Option<u64>,
    pub process_count: Option<u64>,
    pub status: Option<String>,
    pub timestamp: Option<String>,
}

/// Per-disk usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskReport {
    pub device: Option<String>,
    pub mountpoint: Option<String>,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub usage: Option<f64>,
}

/// Per-interface counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceReport {
    pub name: Option<String>,
    pub ips: Option<Vec<String>>,
    pub sent_bytes: Option<u64>,
    pub recv_bytes: Option<u64>,
    pub sent_rate: Option<f64>,
    pub recv_rate: Option<f64>,
}

impl AgentReport {
    /// Fold disks and interfaces into a single normalized sample.
    #[must_use]
    pub fn normalize(&self) -> MetricsSample {
        let disks = self.disks.as_deref().unwrap_or_default();
        let interfaces = self.interfaces.as_deref().unwrap_or_default();

        MetricsSample {
            cpu_usage: self.cpu_usage.unwrap_or_default(),
            memory_total: self.memory_total.unwrap_or_default(),
            memory_used: self.memory_used.unwrap_or_default(),
            disk_total: disks.iter().filter_map(|d| d.total_bytes).sum(),
            disk_used: disks.iter().filter_map(|d| d.used_bytes).sum(),
            network_rx_bytes: interfaces.iter().filter_map(|i| i.recv_bytes).sum(),
            network_tx_bytes: interfaces.iter().filter_map(|i| i.sent_bytes).sum(),
            network_rx_rate: interfaces.iter().filter_map(|i| i.recv_rate).sum(),
            network_tx_rate: interfaces.iter().filter_map(|i| i.sent_rate).sum(),
            load_average_1m: None,
            load_average_5m: None,
            load_average_15m: None,
            process_count: self.process_count,
            uptime_seconds: self.uptime_seconds,
            temperature: self.temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_rounding() {
        assert!((percentage(250, 1000) - 25.0).abs() < f64::EPSILON);
        assert!((percentage(1, 3) - 33.33).abs() < f64::EPSILON);
        assert!((percentage(2, 3) - 66.67).abs() < f64::EPSILON);
        assert!(percentage(5, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_normalize_polled_report() {
        let json = r#"{
            "nodeId": "node-a",
            "cpu": 12.5,
            "temp": 48.0,
            "memTotalBytes": 2000,
            "memUsedBytes": 500,
            "disks": [
                {"device": "/dev/sda1", "totalBytes": 100, "usedBytes": 40},
                {"device": "/dev/sdb1", "totalBytes": 300, "usedBytes": 60}
            ],
            "interfaces": [
                {"name": "eth0", "sentBytes": 10, "recvBytes": 20, "sentRate": 1.5, "recvRate": 2.5},
                {"name": "lo", "sentBytes": 1, "recvBytes": 2}
            ],
            "status": "ok"
        }"#;
        let report: AgentReport = serde_json::from_str(json).unwrap();
        let sample = report.normalize();

        assert!((sample.cpu_usage - 12.5).abs() < f64::EPSILON);
        assert_eq!(sample.memory_total, 2000);
        assert_eq!(sample.disk_total, 400);
        assert_eq!(sample.disk_used, 100);
        assert_eq!(sample.network_rx_bytes, 22);
        assert_eq!(sample.network_tx_bytes, 11);
        assert!((sample.network_rx_rate - 2.5).abs() < f64::EPSILON);
        assert_eq!(sample.temperature, Some(48.0));
        assert!((sample.disk_usage() - 25.0).abs() < f64::EPSILON);
        assert!((sample.memory_usage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_normalize_pushed_report_with_null_lists() {
        let json = r#"{
            "nodeId": "node-b",
            "cpuUsage": 50,
            "memoryTotal": 1000,
            "memoryUsed": 250,
            "disks": null,
            "interfaces": null,
            "uptimeSeconds": 3600,
            "processCount": 120
        }"#;
        let report: AgentReport = serde_json::from_str(json).unwrap();
        let sample = report.normalize();

        assert!((sample.cpu_usage - 50.0).abs() < f64::EPSILON);
        assert_eq!(sample.disk_total, 0);
        assert_eq!(sample.network_rx_bytes, 0);
        assert_eq!(sample.uptime_seconds, Some(3600));
        assert_eq!(sample.process_count, Some(120));
    }

    #[test]
    fn test_sample_defaults_missing_fields() {
        let sample: MetricsSample =
            serde_json::from_str(r#"{"cpuUsage": 50, "memoryTotal": 1000, "memoryUsed": 250}"#)
                .unwrap();
        assert_eq!(sample.disk_total, 0);
        assert!(sample.load_average_1m.is_none());
    }
}

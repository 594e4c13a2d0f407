//! Point-to-point metrics pulls.

use std::time::Duration;

use async_trait::async_trait;
use horizon_core::{AgentIdentity, AgentReport, MetricsSample};
use thiserror::Error;

/// Poll error.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Agent answered with status {0}")]
    Status(u16),
    #[error("Invalid metrics payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Somewhere a normalized sample can be pulled from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Pull one sample from the agent.
    async fn fetch(&self, agent: &AgentIdentity) -> Result<MetricsSample, PollError>;
}

/// Pulls `GET http://{address}:{port}/metrics` from the agent.
#[derive(Debug, Clone)]
pub struct HttpMetricsSource {
    client: reqwest::Client,
    default_port: u16,
}

impl HttpMetricsSource {
    /// Create a source whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, default_port: u16) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self {
            client,
            default_port,
        })
    }

    /// Metrics URL for the agent.
    #[must_use]
    pub fn endpoint(&self, agent: &AgentIdentity) -> String {
        format!(
            "http://{}:{}/metrics",
            agent.address,
            agent.port_or(self.default_port)
        )
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self, agent: &AgentIdentity) -> Result<MetricsSample, PollError> {
        let response = self.client.get(self.endpoint(agent)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        let report: AgentReport = serde_json::from_slice(&body)?;
        Ok(report.normalize())
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, http::StatusCode, routing::get};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn agent(port: u16) -> AgentIdentity {
        let mut agent = AgentIdentity::new(1, "web-1", "127.0.0.1").polled_every(1000);
        agent.port = Some(port);
        agent
    }

    #[tokio::test]
    async fn test_fetch_normalizes_report() {
        let port = serve(Router::new().route(
            "/metrics",
            get(|| async {
                Json(serde_json::json!({
                    "cpu": 42.5,
                    "memTotalBytes": 4000,
                    "memUsedBytes": 1000,
                    "disks": [
                        {"device": "sda1", "totalBytes": 100, "usedBytes": 40},
                        {"device": "sdb1", "totalBytes": 300, "usedBytes": 60}
                    ],
                    "interfaces": [
                        {"name": "eth0", "sentBytes": 10, "recvBytes": 20, "sentRate": 1.5, "recvRate": 2.5}
                    ],
                    "uptimeSeconds": 3600
                }))
            }),
        ))
        .await;

        let source = HttpMetricsSource::new(Duration::from_secs(3), 9090).unwrap();
        let sample = source.fetch(&agent(port)).await.unwrap();

        assert!((sample.cpu_usage - 42.5).abs() < f64::EPSILON);
        assert_eq!(sample.memory_total, 4000);
        assert_eq!(sample.disk_total, 400);
        assert_eq!(sample.disk_used, 100);
        assert_eq!(sample.network_rx_bytes, 20);
        assert_eq!(sample.uptime_seconds, Some(3600));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let port = serve(Router::new().route(
            "/metrics",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;

        let source = HttpMetricsSource::new(Duration::from_secs(3), 9090).unwrap();
        let err = source.fetch(&agent(port)).await.unwrap_err();
        assert!(matches!(err, PollError::Status(503)));
    }

    #[tokio::test]
    async fn test_garbage_payload() {
        let port = serve(Router::new().route("/metrics", get(|| async { "not json" }))).await;

        let source = HttpMetricsSource::new(Duration::from_secs(3), 9090).unwrap();
        let err = source.fetch(&agent(port)).await.unwrap_err();
        assert!(matches!(err, PollError::Decode(_)));
    }

    #[test]
    fn test_endpoint_uses_default_port() {
        let source = HttpMetricsSource::new(Duration::from_secs(3), 9090).unwrap();
        let agent = AgentIdentity::new(1, "a", "10.1.2.3");
        assert_eq!(source.endpoint(&agent), "http://10.1.2.3:9090/metrics");
    }
}

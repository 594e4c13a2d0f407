//! Collaborator traits and the agent identity model.
//!
//! Persistence, key issuance and agent CRUD live outside this workspace.
//! The realtime layer reaches them only through the narrow traits below.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::{MetricsSample, RealtimeSnapshot};

/// Agent identifier.
pub type AgentId = i64;

/// Client key identifier.
pub type ClientId = i64;

/// How the backend obtains metrics for an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// The agent pushes its own metrics.
    #[default]
    Push,
    /// The backend pulls metrics from the agent's `/metrics` endpoint.
    Poll,
}

/// Everything the realtime layer needs to know about an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub id: AgentId,
    pub name: String,
    /// Address the agent was last seen at (and is polled at).
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Poll interval in milliseconds.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

const fn default_enabled() -> bool {
    true
}

impl AgentIdentity {
    /// Create an enabled push-mode identity.
    #[must_use]
    pub fn new(id: AgentId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            port: None,
            poll_interval_ms: None,
            mode: AgentMode::Push,
            enabled: true,
            node_id: None,
            client_id: None,
            hostname: None,
            os: None,
            platform: None,
            last_seen_at: None,
        }
    }

    /// Switch the identity to poll mode with the given interval.
    #[must_use]
    pub const fn polled_every(mut self, interval_ms: u64) -> Self {
        self.mode = AgentMode::Poll;
        self.poll_interval_ms = Some(interval_ms);
        self
    }

    /// Whether the scheduler should keep a poll task for this agent.
    #[must_use]
    pub fn wants_polling(&self) -> bool {
        self.enabled && self.mode == AgentMode::Poll
    }

    /// Poll interval, falling back to `default` when unset or zero.
    #[must_use]
    pub fn poll_interval(&self, default: Duration) -> Duration {
        match self.poll_interval_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => default,
        }
    }

    /// Port, falling back to `default` when unset.
    #[must_use]
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

/// Identity of the client key an agent authenticated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub id: ClientId,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub name: String,
}

/// Self-registration request sent by a push agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub node_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    /// Remote address of the registering connection.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Directory error.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Agent not found: {0}")]
    NotFound(AgentId),
    #[error("Directory error: {0}")]
    Internal(String),
}

/// Metrics store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Internal(String),
}

/// Metrics ingestion error.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Agent not found: {0}")]
    UnknownAgent(AgentId),
    #[error("Invalid or expired authentication key")]
    InvalidKey,
    #[error("Agent not registered for node {0}")]
    UnregisteredNode(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read/write access to the agent roster.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// All agents that are currently enabled.
    async fn find_enabled(&self) -> Result<Vec<AgentIdentity>, DirectoryError>;

    /// Look up an agent by id.
    async fn find_by_id(&self, id: AgentId) -> Result<Option<AgentIdentity>, DirectoryError>;

    /// Look up an agent by the node id it registered with under a client key.
    async fn find_by_node(
        &self,
        client_id: ClientId,
        node_id: &str,
    ) -> Result<Option<AgentIdentity>, DirectoryError>;

    /// Create or refresh the agent registered as `(client, node_id)`.
    async fn register(
        &self,
        client: &ClientIdentity,
        registration: AgentRegistration,
    ) -> Result<AgentIdentity, DirectoryError>;

    /// Record that the agent was seen at `at`.
    async fn touch_last_seen(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), DirectoryError>;

    /// Revision feed that ticks after every roster mutation.
    fn changes(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Historical metrics sink.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Append one normalized sample.
    async fn append(
        &self,
        agent_id: AgentId,
        sample: &MetricsSample,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Validates client keys presented by pushing agents.
#[async_trait]
pub trait KeyValidator: Send + Sync {
    /// Resolve a key to its client, or `None` if invalid or expired.
    async fn validate(&self, key: &str) -> Option<ClientIdentity>;
}

/// The common ingestion path shared by pushed and polled metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Store a sample, refresh the realtime snapshot and fan it out.
    async fn ingest(
        &self,
        agent_id: AgentId,
        sample: MetricsSample,
    ) -> Result<RealtimeSnapshot, MetricsError>;
}

//! In-memory collaborators.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{
    AgentDirectory, AgentId, AgentIdentity, AgentMode, AgentRegistration, ClientIdentity,
    KeyValidator, MetricsSample, MetricsStore,
    traits::{ClientId, DirectoryError, StoreError},
};
use tokio::sync::watch;

/// In-memory agent directory.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryDirectory {
    agents: RwLock<HashMap<AgentId, AgentIdentity>>,
    next_id: AtomicI64,
    revision: watch::Sender<u64>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            revision: watch::channel(0).0,
        }
    }

    /// Create a directory seeded with `agents`.
    #[must_use]
    pub fn with_agents(agents: impl IntoIterator<Item = AgentIdentity>) -> Self {
        let directory = Self::new();
        for agent in agents {
            directory.insert(agent);
        }
        directory
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Insert or replace an agent.
    pub fn insert(&self, agent: AgentIdentity) {
        self.next_id.fetch_max(agent.id + 1, Ordering::Relaxed);
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.id, agent);
        self.bump();
    }

    /// Edit an agent in place. Returns `false` if it does not exist.
    pub fn update(&self, id: AgentId, edit: impl FnOnce(&mut AgentIdentity)) -> bool {
        let found = {
            let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
            agents.get_mut(&id).map(edit).is_some()
        };
        if found {
            self.bump();
        }
        found
    }

    /// Remove an agent.
    pub fn remove(&self, id: AgentId) -> Option<AgentIdentity> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Enable or disable an agent.
    pub fn set_enabled(&self, id: AgentId, enabled: bool) -> bool {
        self.update(id, |agent| agent.enabled = enabled)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_node(agent: &AgentIdentity, client_id: ClientId, node_id: &str) -> bool {
    agent.client_id == Some(client_id) && agent.node_id.as_deref() == Some(node_id)
}

#[async_trait]
impl AgentDirectory for MemoryDirectory {
    async fn find_enabled(&self) -> Result<Vec<AgentIdentity>, DirectoryError> {
        let agents = self
            .agents
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let mut result: Vec<_> = agents.values().filter(|a| a.enabled).cloned().collect();
        result.sort_by_key(|a| a.id);
        Ok(result)
    }

    async fn find_by_id(&self, id: AgentId) -> Result<Option<AgentIdentity>, DirectoryError> {
        Ok(self
            .agents
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn find_by_node(
        &self,
        client_id: ClientId,
        node_id: &str,
    ) -> Result<Option<AgentIdentity>, DirectoryError> {
        Ok(self
            .agents
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .values()
            .find(|a| matches_node(a, client_id, node_id))
            .cloned())
    }

    async fn register(
        &self,
        client: &ClientIdentity,
        registration: AgentRegistration,
    ) -> Result<AgentIdentity, DirectoryError> {
        let agent = {
            let mut agents = self
                .agents
                .write()
                .map_err(|e| DirectoryError::Internal(e.to_string()))?;

            let existing = agents
                .values_mut()
                .find(|a| matches_node(a, client.id, &registration.node_id));

            if let Some(agent) = existing {
                if registration.hostname.is_some() {
                    agent.hostname = registration.hostname;
                }
                if registration.os.is_some() {
                    agent.os = registration.os;
                }
                if registration.platform.is_some() {
                    agent.platform = registration.platform;
                }
                if !registration.address.is_empty() {
                    agent.address = registration.address;
                }
                agent.port = registration.port.or(agent.port);
                agent.last_seen_at = Some(Utc::now());
                agent.clone()
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let name = registration
                    .hostname
                    .clone()
                    .unwrap_or_else(|| registration.node_id.clone());
                let agent = AgentIdentity {
                    port: registration.port,
                    mode: AgentMode::Push,
                    node_id: Some(registration.node_id),
                    client_id: Some(client.id),
                    hostname: registration.hostname,
                    os: registration.os,
                    platform: registration.platform,
                    last_seen_at: Some(Utc::now()),
                    ..AgentIdentity::new(id, name, registration.address)
                };
                agents.insert(id, agent.clone());
                agent
            }
        };
        self.bump();
        Ok(agent)
    }

    async fn touch_last_seen(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), DirectoryError> {
        let mut agents = self
            .agents
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let agent = agents.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        agent.last_seen_at = Some(at);
        Ok(())
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.revision.subscribe())
    }
}

/// One stored sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub at: DateTime<Utc>,
    pub sample: MetricsSample,
}

/// In-memory metrics history, bounded per agent.
pub struct MemoryMetricsStore {
    limit: usize,
    history: RwLock<HashMap<AgentId, VecDeque<StoredSample>>>,
}

impl MemoryMetricsStore {
    /// Keep at most `limit` samples per agent, oldest dropped first.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Stored samples for an agent, oldest first.
    #[must_use]
    pub fn history(&self, agent_id: AgentId) -> Vec<StoredSample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn append(
        &self,
        agent_id: AgentId,
        sample: &MetricsSample,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut history = self
            .history
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let samples = history.entry(agent_id).or_default();
        if samples.len() >= self.limit {
            samples.pop_front();
        }
        samples.push_back(StoredSample {
            at,
            sample: sample.clone(),
        });
        Ok(())
    }
}

/// Fixed table of client keys.
#[derive(Default)]
pub struct StaticKeyValidator {
    keys: HashMap<String, ClientIdentity>,
}

impl StaticKeyValidator {
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = (String, ClientIdentity)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[async_trait]
impl KeyValidator for StaticKeyValidator {
    async fn validate(&self, key: &str) -> Option<ClientIdentity> {
        self.keys.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    fn client(id: ClientId) -> ClientIdentity {
        ClientIdentity {
            id,
            user_id: None,
            name: format!("client-{id}"),
        }
    }

    fn registration(node: &str, address: &str) -> AgentRegistration {
        AgentRegistration {
            node_id: node.into(),
            hostname: Some(format!("{node}.local")),
            os: Some("linux".into()),
            platform: None,
            address: address.into(),
            port: None,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_node() {
        let directory = MemoryDirectory::new();
        let first = directory
            .register(&client(1), registration("n1", "10.0.0.1"))
            .await
            .unwrap();
        let again = directory
            .register(&client(1), registration("n1", "10.0.0.9"))
            .await
            .unwrap();
        let other_client = directory
            .register(&client(2), registration("n1", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.address, "10.0.0.9");
        assert_ne!(first.id, other_client.id);
        assert_eq!(directory.len(), 2);
        assert_eq!(first.name, "n1.local");
    }

    #[tokio::test]
    async fn test_ids_continue_after_seed() {
        let directory = MemoryDirectory::with_agents([AgentIdentity::new(7, "seed", "10.0.0.7")]);
        let agent = directory
            .register(&client(1), registration("n1", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(agent.id, 8);
    }

    #[tokio::test]
    async fn test_changes_tick_on_mutation() {
        let directory = MemoryDirectory::new();
        let mut changes = directory.changes().unwrap();

        directory.insert(AgentIdentity::new(1, "a", "10.0.0.1"));
        assert_ok!(changes.changed().await);
        directory.set_enabled(1, false);
        assert_ok!(changes.changed().await);
        assert!(directory.find_enabled().await.unwrap().is_empty());

        assert_ok!(directory.touch_last_seen(1, Utc::now()).await);
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_touch_unknown_agent() {
        let directory = MemoryDirectory::new();
        assert!(matches!(
            directory.touch_last_seen(3, Utc::now()).await,
            Err(DirectoryError::NotFound(3))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = MemoryMetricsStore::new(2);
        for cpu in [1.0, 2.0, 3.0] {
            let sample = MetricsSample {
                cpu_usage: cpu,
                ..MetricsSample::default()
            };
            store.append(1, &sample, Utc::now()).await.unwrap();
        }

        let history = store.history(1);
        assert_eq!(history.len(), 2);
        assert!((history[0].sample.cpu_usage - 2.0).abs() < f64::EPSILON);
        assert!(store.history(2).is_empty());
    }

    #[tokio::test]
    async fn test_static_keys() {
        let keys = StaticKeyValidator::new([("k".to_owned(), client(4))]);
        assert_eq!(keys.validate("k").await.map(|c| c.id), Some(4));
        assert!(keys.validate("nope").await.is_none());
    }
}

//! Metrics ingestion and realtime queries.
//!
//! Pushed and polled samples both enter through [`MetricsSink::ingest`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use horizon_core::{
    AgentDirectory, AgentId, AgentIdentity, AgentRegistration, AgentReport, BroadcastHub,
    ClientIdentity, KeyValidator, MetricsError, MetricsSample, MetricsSink, MetricsStore,
    RealtimeSnapshot, SnapshotCache, Subscription,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Realtime metrics service.
pub struct MetricsService {
    directory: Arc<dyn AgentDirectory>,
    store: Arc<dyn MetricsStore>,
    keys: Arc<dyn KeyValidator>,
    cache: Arc<SnapshotCache>,
    hub: Arc<BroadcastHub>,
}

impl MetricsService {
    #[must_use]
    pub fn new(
        directory: Arc<dyn AgentDirectory>,
        store: Arc<dyn MetricsStore>,
        keys: Arc<dyn KeyValidator>,
        cache: Arc<SnapshotCache>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            directory,
            store,
            keys,
            cache,
            hub,
        }
    }

    #[must_use]
    pub const fn directory(&self) -> &Arc<dyn AgentDirectory> {
        &self.directory
    }

    async fn identity(&self, agent_id: AgentId) -> Result<AgentIdentity, MetricsError> {
        self.directory
            .find_by_id(agent_id)
            .await?
            .ok_or(MetricsError::UnknownAgent(agent_id))
    }

    async fn client(&self, key: &str) -> Result<ClientIdentity, MetricsError> {
        self.keys.validate(key).await.ok_or(MetricsError::InvalidKey)
    }

    /// Realtime snapshot for one agent.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the directory does not know the id.
    pub async fn get(&self, agent_id: AgentId) -> Result<RealtimeSnapshot, MetricsError> {
        let identity = self.identity(agent_id).await?;
        Ok(self.cache.get(&identity))
    }

    /// Realtime snapshots for every enabled agent.
    ///
    /// # Errors
    /// Returns a directory error if the roster cannot be read.
    pub async fn get_all(&self) -> Result<Vec<RealtimeSnapshot>, MetricsError> {
        let agents = self.directory.find_enabled().await?;
        Ok(self.cache.get_all(&agents))
    }

    /// Subscribe to every agent, starting from the current snapshot set.
    ///
    /// # Errors
    /// Returns a directory error if the roster cannot be read.
    pub async fn subscribe_all(&self) -> Result<Subscription, MetricsError> {
        let initial = self.get_all().await?;
        Ok(self.hub.subscribe_all(initial))
    }

    /// Subscribe to one agent, starting from its current snapshot.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if the directory does not know the id.
    pub async fn subscribe(&self, agent_id: AgentId) -> Result<Subscription, MetricsError> {
        let initial = self.get(agent_id).await?;
        Ok(self.hub.subscribe(agent_id, initial))
    }

    /// Accept a report from a key-authenticated push agent.
    ///
    /// # Errors
    /// Returns `InvalidKey` for a rejected key and `UnregisteredNode` when no
    /// agent is registered for the report's node under that key.
    pub async fn push(
        &self,
        key: &str,
        report: &AgentReport,
    ) -> Result<RealtimeSnapshot, MetricsError> {
        let client = self.client(key).await?;
        let node_id = report.node_id.clone().unwrap_or_default();
        let agent = self
            .directory
            .find_by_node(client.id, &node_id)
            .await?
            .ok_or(MetricsError::UnregisteredNode(node_id))?;
        self.ingest(agent.id, report.normalize()).await
    }

    /// Evict cached snapshots of agents the directory no longer knows.
    ///
    /// # Errors
    /// Returns a directory error if a lookup fails.
    pub async fn reclaim(&self) -> Result<usize, MetricsError> {
        let mut evicted = 0;
        for agent_id in self.cache.agent_ids() {
            if self.directory.find_by_id(agent_id).await?.is_none() && self.cache.evict(agent_id) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted snapshots of removed agents");
        }
        Ok(evicted)
    }

    /// Run [`Self::reclaim`] every `period` and on directory changes until cancelled.
    pub fn spawn_reclaim(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut changes = self.directory.changes();

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    alive = next_change(&mut changes) => {
                        if !alive {
                            changes = None;
                            continue;
                        }
                    }
                }
                if let Err(e) = self.reclaim().await {
                    tracing::warn!("Snapshot reclaim failed: {e}");
                }
            }
        })
    }

    /// Register (or refresh) a push agent under a client key.
    ///
    /// # Errors
    /// Returns `InvalidKey` for a rejected key, or a directory error.
    pub async fn register(
        &self,
        key: &str,
        registration: AgentRegistration,
    ) -> Result<AgentIdentity, MetricsError> {
        let client = self.client(key).await?;
        let agent = self.directory.register(&client, registration).await?;
        tracing::info!(
            agent_id = agent.id,
            client_id = client.id,
            node_id = agent.node_id.as_deref().unwrap_or_default(),
            "Agent registered"
        );
        Ok(agent)
    }
}

async fn next_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl MetricsSink for MetricsService {
    async fn ingest(
        &self,
        agent_id: AgentId,
        sample: MetricsSample,
    ) -> Result<RealtimeSnapshot, MetricsError> {
        let identity = self.identity(agent_id).await?;
        let now = Utc::now();

        if let Err(e) = self.store.append(agent_id, &sample, now).await {
            tracing::warn!(agent_id, "Failed to store metrics sample: {e}");
        }
        if let Err(e) = self.directory.touch_last_seen(agent_id, now).await {
            tracing::warn!(agent_id, "Failed to update last seen: {e}");
        }

        let snapshot = self.cache.ingest(&identity, &sample);
        let delivered = self.hub.broadcast(&snapshot);
        tracing::debug!(agent_id, delivered, "Metrics ingested");
        Ok(snapshot)
    }
}

//! Realtime snapshot cache with a freshness TTL.
//!
//! The cache is the source of truth for "online": an agent is online only
//! while its last ingest is younger than the TTL.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use tokio::time::Instant;

use crate::{AgentId, AgentIdentity, MetricsSample, RealtimeSnapshot};

struct Entry {
    snapshot: RealtimeSnapshot,
    refreshed: Instant,
}

/// Latest snapshot per agent.
pub struct SnapshotCache {
    ttl: Duration,
    entries: RwLock<HashMap<AgentId, Entry>>,
}

impl SnapshotCache {
    /// Create a cache whose entries go stale after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Write a fresh online snapshot for the agent and return it.
    pub fn ingest(&self, identity: &AgentIdentity, sample: &MetricsSample) -> RealtimeSnapshot {
        let snapshot = RealtimeSnapshot::online(identity, sample, Utc::now());
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                identity.id,
                Entry {
                    snapshot: snapshot.clone(),
                    refreshed: Instant::now(),
                },
            );
        snapshot
    }

    /// Snapshot for the agent, synthesized offline when missing or stale.
    #[must_use]
    pub fn get(&self, identity: &AgentIdentity) -> RealtimeSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&identity.id) {
            Some(e) if e.refreshed.elapsed() <= self.ttl => e.snapshot.clone(),
            Some(e) => e.snapshot.expired(Utc::now()),
            None => RealtimeSnapshot::offline(identity, Utc::now()),
        }
    }

    /// One snapshot per identity, each checked independently.
    #[must_use]
    pub fn get_all(&self, identities: &[AgentIdentity]) -> Vec<RealtimeSnapshot> {
        identities.iter().map(|identity| self.get(identity)).collect()
    }

    /// Drop the agent's entry.
    pub fn evict(&self, agent_id: AgentId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id)
            .is_some()
    }

    /// Agents with an entry, fresh or not.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of cached entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

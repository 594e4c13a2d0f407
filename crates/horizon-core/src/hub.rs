//! Fan-out of realtime snapshots to long-lived subscribers.
//!
//! Sinks are kept in an arena keyed by an opaque id. The first failed
//! write to a sink is its disconnect signal: it is pruned on the spot.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{AgentId, RealtimeSnapshot};

/// Subscriber handle id.
pub type SinkId = Uuid;

/// Event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HubEvent {
    /// Full snapshot set, sent once on connect to an all-agents stream.
    Init(Vec<RealtimeSnapshot>),
    /// Single snapshot, sent once on connect to a per-agent stream.
    InitAgent(Box<RealtimeSnapshot>),
    /// A freshly ingested snapshot.
    Metrics(Box<RealtimeSnapshot>),
    /// Keepalive.
    Heartbeat,
}

impl HubEvent {
    /// Event name on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) | Self::InitAgent(_) => "init",
            Self::Metrics(_) => "metrics",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Convert to an SSE event (requires `sse` feature).
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    #[cfg(feature = "sse")]
    pub fn to_sse_event(&self) -> Result<axum::response::sse::Event, axum::Error> {
        let event = axum::response::sse::Event::default().event(self.name());
        match self {
            Self::Heartbeat => Ok(event.data("ping")),
            other => event.json_data(other),
        }
    }
}

/// Which events a sink receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every agent's snapshots.
    All,
    /// One agent's snapshots.
    Agent(AgentId),
}

#[derive(Default)]
struct Sinks {
    all: HashMap<SinkId, mpsc::Sender<HubEvent>>,
    per_agent: HashMap<AgentId, HashMap<SinkId, mpsc::Sender<HubEvent>>>,
}

impl Sinks {
    fn remove(&mut self, scope: Scope, id: SinkId) -> bool {
        match scope {
            Scope::All => self.all.remove(&id).is_some(),
            Scope::Agent(agent_id) => {
                let Some(set) = self.per_agent.get_mut(&agent_id) else {
                    return false;
                };
                let removed = set.remove(&id).is_some();
                if set.is_empty() {
                    self.per_agent.remove(&agent_id);
                }
                removed
            }
        }
    }
}

/// A live subscription. Dropping it disconnects the sink on the next write.
#[derive(Debug)]
pub struct Subscription {
    id: SinkId,
    scope: Scope,
    rx: mpsc::Receiver<HubEvent>,
}

impl Subscription {
    /// Sink id, usable with [`BroadcastHub::unsubscribe`].
    #[must_use]
    pub const fn id(&self) -> SinkId {
        self.id
    }

    /// Scope this subscription was created with.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }

    /// Receive the next event, `None` once the hub dropped the sink.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    /// Stream of events.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<HubEvent> {
        ReceiverStream::new(self.rx)
    }

    /// SSE stream that ends after `lifetime` (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        self,
        lifetime: Duration,
    ) -> futures::stream::BoxStream<'static, Result<axum::response::sse::Event, std::io::Error>>
    {
        use futures::StreamExt as _;

        self.into_stream()
            .map(|event| event.to_sse_event().map_err(std::io::Error::other))
            .take_until(tokio::time::sleep(lifetime))
            .boxed()
    }
}

/// Broadcast hub with per-agent and all-agents sink sets.
pub struct BroadcastHub {
    capacity: usize,
    sinks: RwLock<Sinks>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastHub {
    /// Create a hub whose sinks buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sinks: RwLock::new(Sinks::default()),
        }
    }

    fn attach(&self, scope: Scope, first: HubEvent) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        // Fresh channel with capacity >= 1, cannot fail.
        let _ = tx.try_send(first);

        let id = Uuid::new_v4();
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        match scope {
            Scope::All => {
                sinks.all.insert(id, tx);
            }
            Scope::Agent(agent_id) => {
                sinks.per_agent.entry(agent_id).or_default().insert(id, tx);
            }
        }
        tracing::debug!(sink_id = %id, ?scope, "Subscriber attached");

        Subscription { id, scope, rx }
    }

    /// Subscribe to every agent's snapshots, starting with `initial`.
    #[must_use]
    pub fn subscribe_all(&self, initial: Vec<RealtimeSnapshot>) -> Subscription {
        self.attach(Scope::All, HubEvent::Init(initial))
    }

    /// Subscribe to one agent's snapshots, starting with `initial`.
    #[must_use]
    pub fn subscribe(&self, agent_id: AgentId, initial: RealtimeSnapshot) -> Subscription {
        self.attach(Scope::Agent(agent_id), HubEvent::InitAgent(Box::new(initial)))
    }

    /// Remove a sink explicitly.
    pub fn unsubscribe(&self, scope: Scope, id: SinkId) -> bool {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope, id)
    }

    /// Push a snapshot to the all-agents sinks and to the agent's own sinks.
    ///
    /// Returns the number of sinks that accepted it.
    pub fn broadcast(&self, snapshot: &RealtimeSnapshot) -> usize {
        let targets = {
            let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
            let mut targets: Vec<_> = sinks
                .all
                .iter()
                .map(|(id, tx)| (Scope::All, *id, tx.clone()))
                .collect();
            if let Some(set) = sinks.per_agent.get(&snapshot.agent_id) {
                targets.extend(
                    set.iter()
                        .map(|(id, tx)| (Scope::Agent(snapshot.agent_id), *id, tx.clone())),
                );
            }
            targets
        };

        let event = HubEvent::Metrics(Box::new(snapshot.clone()));
        self.deliver(targets, &event)
    }

    /// Push a keepalive to every sink, pruning those that fail.
    ///
    /// Returns the number of pruned sinks.
    pub fn heartbeat(&self) -> usize {
        let targets = {
            let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
            let mut targets: Vec<_> = sinks
                .all
                .iter()
                .map(|(id, tx)| (Scope::All, *id, tx.clone()))
                .collect();
            for (agent_id, set) in &sinks.per_agent {
                targets.extend(
                    set.iter()
                        .map(|(id, tx)| (Scope::Agent(*agent_id), *id, tx.clone())),
                );
            }
            targets
        };

        let total = targets.len();
        let delivered = self.deliver(targets, &HubEvent::Heartbeat);
        total - delivered
    }

    fn deliver(
        &self,
        targets: Vec<(Scope, SinkId, mpsc::Sender<HubEvent>)>,
        event: &HubEvent,
    ) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;

        for (scope, id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(sink_id = %id, "Subscriber lagging, dropping it");
                    dead.push((scope, id));
                }
                Err(TrySendError::Closed(_)) => dead.push((scope, id)),
            }
        }

        if !dead.is_empty() {
            let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
            for (scope, id) in dead {
                if sinks.remove(scope, id) {
                    tracing::debug!(sink_id = %id, ?scope, "Pruned dead subscriber");
                }
            }
        }

        delivered
    }

    /// Total number of live sinks.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        sinks.all.len() + sinks.per_agent.values().map(HashMap::len).sum::<usize>()
    }

    /// Send heartbeats every `period` while there are subscribers.
    pub fn spawn_heartbeat(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let count = self.connection_count();
                if count == 0 {
                    continue;
                }
                let pruned = self.heartbeat();
                tracing::debug!(connections = count, pruned, "Heartbeat sent");
            }
        })
    }
}

//! Registry of live agent sessions.
//!
//! At most one session per agent is live. A reconnect replaces the entry,
//! and the stale handle simply fails on its next write.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use horizon_core::{AgentId, AgentRequest};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of one connection, distinct across reconnects of the same agent.
pub type SessionId = Uuid;

/// Registry error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Agent not connected: {0}")]
    NotConnected(AgentId),
    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

/// Write side of one agent connection.
///
/// The transport owns the receiving end and forwards every text frame to
/// the socket in order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    /// Wrap an outbound channel in a fresh handle.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Create a handle along with the receiver the transport drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the transport is still draining this handle.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Serialize and queue a frame.
    ///
    /// # Errors
    /// Returns `TransportFailure` if the frame cannot be encoded or the
    /// transport has gone away.
    pub fn send(&self, frame: &AgentRequest) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame).map_err(|e| {
            tracing::error!("Failed to serialize agent frame: {e}");
            SessionError::TransportFailure(e.to_string())
        })?;
        self.tx
            .send(text)
            .map_err(|_| SessionError::TransportFailure("session closed".into()))
    }
}

/// One live bidirectional connection.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: AgentId,
    pub handle: SessionHandle,
    pub connected_at: DateTime<Utc>,
}

/// Live sessions keyed by agent.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<AgentId, AgentSession>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the agent's session, returning the one it replaced.
    pub fn register(&self, agent_id: AgentId, handle: SessionHandle) -> Option<AgentSession> {
        let session = AgentSession {
            agent_id,
            handle,
            connected_at: Utc::now(),
        };
        let replaced = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id, session);
        if let Some(old) = &replaced {
            tracing::info!(agent_id, session_id = %old.handle.id(), "Replaced stale agent session");
        }
        replaced
    }

    /// Remove the agent's session if it is still `session_id`.
    ///
    /// A close callback from a replaced session finds a different id and
    /// leaves the newer session alone.
    pub fn unregister(&self, agent_id: AgentId, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&agent_id) {
            Some(current) if current.handle.id() == session_id => {
                sessions.remove(&agent_id);
                true
            }
            _ => false,
        }
    }

    /// Whether the agent has a session whose transport is still open.
    #[must_use]
    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.handle(agent_id).is_some()
    }

    /// Current open handle for the agent.
    #[must_use]
    pub fn handle(&self, agent_id: AgentId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .map(|s| s.handle.clone())
            .filter(SessionHandle::is_open)
    }

    /// Current session details for the agent.
    #[must_use]
    pub fn session(&self, agent_id: AgentId) -> Option<AgentSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .cloned()
    }

    /// Send a frame to the agent's current session.
    ///
    /// # Errors
    /// Returns `NotConnected` when there is no open session, and
    /// `TransportFailure` when the write fails. A failed session is removed.
    pub fn send(&self, agent_id: AgentId, frame: &AgentRequest) -> Result<SessionId, SessionError> {
        let handle = self
            .handle(agent_id)
            .ok_or(SessionError::NotConnected(agent_id))?;
        self.send_on(agent_id, &handle, frame)?;
        Ok(handle.id())
    }

    /// Send a frame over a specific handle of the agent.
    ///
    /// # Errors
    /// Returns `TransportFailure` when the write fails. The handle's session
    /// is removed if it is still the current one.
    pub fn send_on(
        &self,
        agent_id: AgentId,
        handle: &SessionHandle,
        frame: &AgentRequest,
    ) -> Result<(), SessionError> {
        handle.send(frame).inspect_err(|e| {
            tracing::warn!(agent_id, session_id = %handle.id(), "Agent write failed: {e}");
            self.unregister(agent_id, handle.id());
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

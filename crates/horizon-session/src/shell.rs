//! Interactive shell multiplexing.
//!
//! One shell per agent, mirrored to any number of observers. Output frames
//! are relayed as the exact text the agent sent.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use horizon_core::{AgentId, AgentReply, AgentRequest, frame::shell_error};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::{ConnectionRegistry, SessionError};

/// Observer connection id.
pub type ObserverId = Uuid;

/// Shell error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShellError {
    #[error("{0}")]
    Validation(String),
    #[error("Agent is offline")]
    NotConnected(AgentId),
    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

impl From<SessionError> for ShellError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected(id) => Self::NotConnected(id),
            SessionError::TransportFailure(msg) => Self::TransportFailure(msg),
        }
    }
}

/// Write side of an observer connection.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: ObserverId,
    tx: mpsc::UnboundedSender<String>,
}

impl ObserverHandle {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Queue a text frame. Returns `false` once the observer is gone.
    pub fn send(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }
}

/// Lifecycle of an agent's shell. No entry means no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// `shell_start` sent, no output yet.
    Starting,
    /// The agent has produced output.
    Active,
}

struct ShellSession {
    state: ShellState,
    observers: HashMap<ObserverId, ObserverHandle>,
}

/// Shell sessions keyed by agent.
pub struct ShellMultiplexer {
    registry: Arc<ConnectionRegistry>,
    sessions: RwLock<HashMap<AgentId, ShellSession>>,
}

impl ShellMultiplexer {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Attach an observer and ask the agent to start its shell.
    ///
    /// # Errors
    /// Returns `NotConnected` for an offline agent, or `TransportFailure` if
    /// the start frame cannot be written (the observer is then detached).
    pub fn start(
        &self,
        agent_id: AgentId,
        observer: &ObserverHandle,
        cols: u16,
        rows: u16,
    ) -> Result<(), ShellError> {
        if !self.registry.is_connected(agent_id) {
            return Err(ShellError::NotConnected(agent_id));
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(agent_id)
            .or_insert_with(|| ShellSession {
                state: ShellState::Starting,
                observers: HashMap::new(),
            })
            .observers
            .insert(observer.id(), observer.clone());

        if let Err(e) = self
            .registry
            .send(agent_id, &AgentRequest::shell_start(cols, rows))
        {
            if let Some(session) = sessions.get_mut(&agent_id) {
                session.observers.remove(&observer.id());
                if session.observers.is_empty() {
                    sessions.remove(&agent_id);
                }
            }
            return Err(e.into());
        }
        drop(sessions);
        tracing::info!(agent_id, observer_id = %observer.id(), cols, rows, "Shell started");
        Ok(())
    }

    /// Forward raw input to the agent.
    ///
    /// # Errors
    /// Returns `Validation` for empty input, otherwise any send failure.
    pub fn input(&self, agent_id: AgentId, data: &str) -> Result<(), ShellError> {
        if data.is_empty() {
            return Err(ShellError::Validation("Shell input must not be empty".into()));
        }
        self.registry.send(
            agent_id,
            &AgentRequest::ShellInput {
                data: data.to_owned(),
            },
        )?;
        Ok(())
    }

    /// Forward a geometry change. Works without a tracked shell.
    ///
    /// # Errors
    /// Returns any send failure.
    pub fn resize(&self, agent_id: AgentId, cols: u16, rows: u16) -> Result<(), ShellError> {
        self.registry
            .send(agent_id, &AgentRequest::shell_resize(cols, rows))?;
        Ok(())
    }

    /// Detach an observer. The last one out stops the agent's shell.
    ///
    /// Also used for observers that vanish without an explicit stop.
    /// Returns `true` if the shell was stopped.
    pub fn stop(&self, agent_id: AgentId, observer_id: ObserverId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        self.detach(&mut sessions, agent_id, observer_id)
    }

    /// Removes the observer. When it was the last one the session is dropped
    /// and `shell_stop` is queued while the lock is still held, so it cannot
    /// overtake the `shell_start` of a concurrent `start`.
    /// Returns `true` if the shell was stopped.
    fn detach(
        &self,
        sessions: &mut HashMap<AgentId, ShellSession>,
        agent_id: AgentId,
        observer_id: ObserverId,
    ) -> bool {
        let Some(session) = sessions.get_mut(&agent_id) else {
            return false;
        };
        if session.observers.remove(&observer_id).is_none() || !session.observers.is_empty() {
            return false;
        }
        sessions.remove(&agent_id);
        self.send_stop(agent_id);
        true
    }

    fn send_stop(&self, agent_id: AgentId) {
        match self.registry.send(agent_id, &AgentRequest::shell_stop()) {
            Ok(_) => tracing::info!(agent_id, "Shell stopped"),
            Err(e) => tracing::debug!(agent_id, "Shell stop not delivered: {e}"),
        }
    }

    /// Mirror an agent shell frame to every observer of that agent.
    ///
    /// Observers that fail are dropped individually. Returns the number of
    /// observers reached.
    pub fn relay(&self, agent_id: AgentId, reply: &AgentReply, raw: &str) -> usize {
        let targets: Vec<_> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let Some(session) = sessions.get_mut(&agent_id) else {
                tracing::debug!(agent_id, "Shell frame with no observers");
                return 0;
            };
            if matches!(reply, AgentReply::ShellOutput { .. }) {
                session.state = ShellState::Active;
            }
            session.observers.values().cloned().collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for observer in targets {
            if observer.send(raw.to_owned()) {
                delivered += 1;
            } else {
                dead.push(observer.id());
            }
        }

        if matches!(reply, AgentReply::ShellExit { .. }) {
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&agent_id);
            tracing::info!(agent_id, "Shell exited");
            return delivered;
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            for id in dead {
                tracing::debug!(agent_id, observer_id = %id, "Pruned dead shell observer");
                self.detach(&mut sessions, agent_id, id);
            }
        }
        delivered
    }

    /// Tear down the agent's shell after it disconnected.
    ///
    /// Every observer is told with an `error` frame. Returns how many were
    /// attached.
    pub fn drop_agent(&self, agent_id: AgentId) -> usize {
        let Some(session) = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id)
        else {
            return 0;
        };

        let notice = shell_error("agent disconnected");
        for observer in session.observers.values() {
            observer.send(notice.clone());
        }
        tracing::info!(
            agent_id,
            observers = session.observers.len(),
            "Shell dropped on agent disconnect"
        );
        session.observers.len()
    }

    #[must_use]
    pub fn state(&self, agent_id: AgentId) -> Option<ShellState> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .map(|s| s.state)
    }

    #[must_use]
    pub fn observer_count(&self, agent_id: AgentId) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .map_or(0, |s| s.observers.len())
    }
}

//! Request/response correlation for agent commands.
//!
//! Every command gets its own token, so any number of commands may be in
//! flight for one agent. Each pending slot resolves exactly once: by the
//! agent's result, by the caller's deadline, or by the session closing.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use horizon_core::{AgentId, AgentRequest, CommandResult, RequestId};
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};
use uuid::Uuid;

use crate::registry::{ConnectionRegistry, SessionError, SessionId};

/// Command error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),
    #[error("Agent is offline")]
    NotConnected(AgentId),
    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Agent disconnected")]
    Disconnected,
    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

impl CommandError {
    /// Exit code reported to the caller: `1` when rejected before anything
    /// was sent, `-1` when execution failed.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::NotConnected(_) => 1,
            Self::Timeout(_) | Self::Disconnected | Self::TransportFailure(_) => -1,
        }
    }

    /// Render as a structured result.
    #[must_use]
    pub fn into_result(self) -> CommandResult {
        CommandResult::failure(self.to_string(), self.exit_code())
    }
}

impl From<SessionError> for CommandError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected(id) => Self::NotConnected(id),
            SessionError::TransportFailure(msg) => Self::TransportFailure(msg),
        }
    }
}

type Slot = oneshot::Sender<Result<CommandResult, CommandError>>;

struct PendingCommand {
    agent_id: AgentId,
    session_id: SessionId,
    seq: u64,
    issued_at: Instant,
    slot: Slot,
}

type PendingMap = Mutex<HashMap<RequestId, PendingCommand>>;

/// Removes the token when the issuing future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    token: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token);
    }
}

/// Outstanding commands keyed by correlation token.
pub struct CommandCorrelator {
    registry: Arc<ConnectionRegistry>,
    pending: PendingMap,
    next_seq: AtomicU64,
}

impl CommandCorrelator {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Send a command and wait for its result.
    ///
    /// # Errors
    /// - `Validation` for blank commands
    /// - `NotConnected` when the agent has no live session (nothing is queued)
    /// - `TransportFailure` when the write fails
    /// - `Timeout` when no result arrives within `timeout`
    /// - `Disconnected` when the session closes first
    pub async fn issue(
        &self,
        agent_id: AgentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        if command.trim().is_empty() {
            return Err(CommandError::Validation("Command must not be empty".into()));
        }
        let handle = self
            .registry
            .handle(agent_id)
            .ok_or(CommandError::NotConnected(agent_id))?;

        let token = Uuid::new_v4();
        let (slot, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token,
                PendingCommand {
                    agent_id,
                    session_id: handle.id(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    issued_at: Instant::now(),
                    slot,
                },
            );
        let _guard = PendingGuard {
            pending: &self.pending,
            token,
        };
        // The session may have closed between the lookup and the insert,
        // after its pending commands were failed.
        if !self
            .registry
            .session(agent_id)
            .is_some_and(|s| s.handle.id() == handle.id())
        {
            return Err(CommandError::Disconnected);
        }

        let frame = AgentRequest::Command {
            request_id: token,
            data: command.to_owned(),
        };
        self.registry.send_on(agent_id, &handle, &frame)?;
        tracing::debug!(agent_id, request_id = %token, "Command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped without a value.
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                tracing::warn!(agent_id, request_id = %token, "Command timed out");
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// Deliver an agent's result.
    ///
    /// Without a token the agent's oldest outstanding command is resolved.
    /// Returns `false` when nothing was waiting (late, duplicate or foreign).
    pub fn resolve(
        &self,
        agent_id: AgentId,
        token: Option<RequestId>,
        result: CommandResult,
    ) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let key = match token {
                Some(token) => pending
                    .get(&token)
                    .filter(|p| p.agent_id == agent_id)
                    .map(|_| token),
                None => pending
                    .iter()
                    .filter(|(_, p)| p.agent_id == agent_id)
                    .min_by_key(|(_, p)| p.seq)
                    .map(|(token, _)| *token),
            };
            key.and_then(|key| pending.remove(&key).map(|p| (key, p)))
        };

        let Some((token, command)) = entry else {
            tracing::debug!(agent_id, "Dropping unmatched command result");
            return false;
        };
        tracing::debug!(
            agent_id,
            request_id = %token,
            elapsed_ms = u64::try_from(command.issued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Command resolved"
        );
        // The caller may have given up already.
        let _ = command.slot.send(Ok(result));
        true
    }

    /// Fail every command issued over the given session.
    ///
    /// Returns how many were failed.
    pub fn fail_session(&self, agent_id: AgentId, session_id: SessionId) -> usize {
        let failed: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let tokens: Vec<_> = pending
                .iter()
                .filter(|(_, p)| p.agent_id == agent_id && p.session_id == session_id)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| pending.remove(&token))
                .collect()
        };

        let count = failed.len();
        for command in failed {
            let _ = command.slot.send(Err(CommandError::Disconnected));
        }
        if count > 0 {
            tracing::info!(agent_id, count, "Failed pending commands on disconnect");
        }
        count
    }

    /// Whether the token is still waiting.
    #[must_use]
    pub fn contains(&self, token: RequestId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&token)
    }

    /// Outstanding commands across all agents.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

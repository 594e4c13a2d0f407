//! Session manager and the per-connection state machine.

use std::{sync::Arc, time::Duration};

use horizon_core::{AgentId, AgentReply, CommandResult};

use crate::{
    correlator::{CommandCorrelator, CommandError},
    registry::{ConnectionRegistry, SessionHandle, SessionId},
    shell::ShellMultiplexer,
};

/// Lifecycle of one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Orchestrates agent sessions, commands and shells.
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<CommandCorrelator>,
    shells: Arc<ShellMultiplexer>,
    command_timeout: Duration,
}

impl SessionManager {
    /// Create a manager whose commands time out after `command_timeout`
    /// unless the caller says otherwise.
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            correlator: Arc::new(CommandCorrelator::new(Arc::clone(&registry))),
            shells: Arc::new(ShellMultiplexer::new(Arc::clone(&registry))),
            registry,
            command_timeout,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn correlator(&self) -> &Arc<CommandCorrelator> {
        &self.correlator
    }

    #[must_use]
    pub const fn shells(&self) -> &Arc<ShellMultiplexer> {
        &self.shells
    }

    /// Begin tracking a new connection for the agent.
    #[must_use]
    pub fn connect(&self, agent_id: AgentId, handle: SessionHandle) -> AgentConnection {
        AgentConnection {
            agent_id,
            handle,
            state: ConnectionState::Connecting,
            registry: Arc::clone(&self.registry),
            correlator: Arc::clone(&self.correlator),
            shells: Arc::clone(&self.shells),
        }
    }

    /// Run a command with the default deadline.
    ///
    /// # Errors
    /// See [`CommandCorrelator::issue`].
    pub async fn execute(
        &self,
        agent_id: AgentId,
        command: &str,
    ) -> Result<CommandResult, CommandError> {
        self.execute_with_timeout(agent_id, command, self.command_timeout)
            .await
    }

    /// Run a command with an explicit deadline.
    ///
    /// # Errors
    /// See [`CommandCorrelator::issue`].
    pub async fn execute_with_timeout(
        &self,
        agent_id: AgentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        self.correlator.issue(agent_id, command, timeout).await
    }

    #[must_use]
    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.registry.is_connected(agent_id)
    }
}

/// One agent connection driven through `Connecting -> Open -> Closed`.
///
/// Every teardown side effect runs from [`close`](Self::close), which the
/// transport calls once its read loop ends. Dropping the connection closes
/// it too.
pub struct AgentConnection {
    agent_id: AgentId,
    handle: SessionHandle,
    state: ConnectionState,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<CommandCorrelator>,
    shells: Arc<ShellMultiplexer>,
}

impl AgentConnection {
    #[must_use]
    pub const fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.handle.id()
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Register the session. Only valid from `Connecting`.
    pub fn open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.registry.register(self.agent_id, self.handle.clone());
        self.state = ConnectionState::Open;
        tracing::info!(agent_id = self.agent_id, session_id = %self.handle.id(), "Agent connected");
        true
    }

    /// Route one inbound text frame.
    ///
    /// Frames that cannot be parsed or are of an unknown type are logged
    /// and ignored.
    pub fn on_frame(&self, raw: &str) {
        if self.state != ConnectionState::Open {
            tracing::debug!(agent_id = self.agent_id, state = ?self.state, "Frame outside open state");
            return;
        }

        let reply: AgentReply = match serde_json::from_str(raw) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(agent_id = self.agent_id, "Invalid agent frame: {e}");
                return;
            }
        };

        match reply {
            AgentReply::CommandResult {
                request_id,
                output,
                error,
                code,
            } => {
                self.correlator.resolve(
                    self.agent_id,
                    request_id,
                    CommandResult {
                        output,
                        error,
                        exit_code: code,
                    },
                );
            }
            AgentReply::ShellOutput { .. } | AgentReply::ShellExit { .. } => {
                self.shells.relay(self.agent_id, &reply, raw);
            }
            AgentReply::Unknown => {
                tracing::warn!(agent_id = self.agent_id, "Unknown agent frame type");
            }
        }
    }

    /// Move to `Closed` and run every teardown side effect once.
    ///
    /// Shells are dropped unless a newer session has replaced this one.
    /// Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closed;
        if !was_open {
            return true;
        }

        // A failed write may already have unregistered this session.
        let current = self.registry.unregister(self.agent_id, self.handle.id())
            || self.registry.session(self.agent_id).is_none();
        let failed = self.correlator.fail_session(self.agent_id, self.handle.id());
        let observers = if current {
            self.shells.drop_agent(self.agent_id)
        } else {
            0
        };
        tracing::info!(
            agent_id = self.agent_id,
            session_id = %self.handle.id(),
            failed_commands = failed,
            shell_observers = observers,
            "Agent disconnected"
        );
        true
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.close();
    }
}

//! Frames exchanged with agents over their session transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation token pairing a command with its result.
pub type RequestId = Uuid;

/// Frame sent from the backend to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Run a command and answer with a `command_result`.
    Command {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        data: String,
    },
    /// Start an interactive shell with the given geometry.
    ShellStart {
        #[serde(default)]
        data: String,
        cols: u16,
        rows: u16,
    },
    /// Raw shell input.
    ShellInput { data: String },
    /// Terminal geometry change.
    ShellResize {
        #[serde(default)]
        data: String,
        cols: u16,
        rows: u16,
    },
    /// Stop the interactive shell.
    ShellStop {
        #[serde(default)]
        data: String,
    },
}

impl AgentRequest {
    /// `shell_start` frame.
    #[must_use]
    pub const fn shell_start(cols: u16, rows: u16) -> Self {
        Self::ShellStart {
            data: String::new(),
            cols,
            rows,
        }
    }

    /// `shell_resize` frame.
    #[must_use]
    pub const fn shell_resize(cols: u16, rows: u16) -> Self {
        Self::ShellResize {
            data: String::new(),
            cols,
            rows,
        }
    }

    /// `shell_stop` frame.
    #[must_use]
    pub const fn shell_stop() -> Self {
        Self::ShellStop {
            data: String::new(),
        }
    }
}

/// Frame received from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    /// Result of a previously issued command.
    ///
    /// Older agents do not echo the `requestId`.
    CommandResult {
        #[serde(default, rename = "requestId")]
        request_id: Option<RequestId>,
        #[serde(default)]
        output: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        code: i32,
    },
    /// Shell output chunk.
    ShellOutput {
        #[serde(default)]
        data: String,
    },
    /// The shell exited.
    ShellExit {
        #[serde(default)]
        data: String,
    },
    /// Anything this backend does not understand.
    #[serde(other)]
    Unknown,
}

/// Outcome of a command as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub output: String,
    pub error: String,
    pub exit_code: i32,
}

impl CommandResult {
    /// Failed outcome with an error message and exit code.
    #[must_use]
    pub fn failure(error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            exit_code,
        }
    }
}

/// `{"type":"error","data":..}` notice sent to a shell observer.
#[must_use]
pub fn shell_error(message: &str) -> String {
    serde_json::json!({ "type": "error", "data": message }).to_string()
}

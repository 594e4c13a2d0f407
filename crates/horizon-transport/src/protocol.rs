//! Wire protocol for operator and agent facing endpoints.

use chrono::{DateTime, Utc};
use horizon_core::{AgentRegistration, AgentReport, CommandResult};
use serde::{Deserialize, Serialize};

const fn default_cols() -> u16 {
    80
}

const fn default_rows() -> u16 {
    24
}

/// Control message from a shell observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellControl {
    /// Start the agent's shell.
    ShellStart {
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    /// Raw keyboard input.
    ShellInput {
        #[serde(default)]
        data: String,
    },
    /// Terminal resized.
    ShellResize {
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    /// Detach from the shell.
    ShellStop {
        #[serde(default)]
        data: String,
    },
}

/// `agentId` query parameter of the websocket endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQuery {
    pub agent_id: Option<String>,
}

/// Body of the command endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
}

/// Response of the command endpoint.
pub type CommandResponse = CommandResult;

/// Self-registration body of a push agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub key: String,
    pub node_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl RegisterRequest {
    /// Split into the key and a registration seen from `address`.
    #[must_use]
    pub fn into_parts(self, address: String) -> (String, AgentRegistration) {
        (
            self.key,
            AgentRegistration {
                node_id: self.node_id,
                hostname: self.hostname,
                os: self.os,
                platform: self.platform,
                address,
                port: self.port,
            },
        )
    }
}

/// Metrics pushed by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    pub key: String,
    #[serde(default)]
    pub metrics: AgentReport,
}

/// JSON envelope of the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    /// Successful response without payload.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_start_defaults_geometry() {
        let msg: ShellControl = serde_json::from_str(r#"{"type":"shell_start","data":""}"#).unwrap();
        assert_eq!(msg, ShellControl::ShellStart { cols: 80, rows: 24 });
    }

    #[test]
    fn test_shell_stop_with_data() {
        let msg: ShellControl = serde_json::from_str(r#"{"type":"shell_stop","data":""}"#).unwrap();
        assert!(matches!(msg, ShellControl::ShellStop { .. }));
    }

    #[test]
    fn test_unknown_control_rejected() {
        assert!(serde_json::from_str::<ShellControl>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ShellControl>("{").is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(ApiResponse::ok("Metrics received")).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Metrics received");
        assert!(json["data"].is_null());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_register_into_parts() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"key":"k","nodeId":"n1","hostname":"db-1","os":"linux","port":9100}"#,
        )
        .unwrap();
        let (key, registration) = req.into_parts("10.0.0.3".into());
        assert_eq!(key, "k");
        assert_eq!(registration.node_id, "n1");
        assert_eq!(registration.address, "10.0.0.3");
        assert_eq!(registration.port, Some(9100));
    }
}

//! WebSocket endpoints for agents and shell observers.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use horizon_core::{AgentId, frame::shell_error};
use horizon_session::{ObserverHandle, SessionHandle, ShellMultiplexer};
use tokio::sync::mpsc;

use crate::{
    AppState,
    protocol::{AgentQuery, ShellControl},
};

/// Parse `agentId` and make sure the directory knows it.
async fn known_agent(state: &AppState, query: &AgentQuery) -> Result<AgentId, Response> {
    let Some(agent_id) = query
        .agent_id
        .as_deref()
        .and_then(|id| id.trim().parse::<AgentId>().ok())
    else {
        return Err((StatusCode::NOT_FOUND, "Unknown agent").into_response());
    };

    match state.metrics.directory().find_by_id(agent_id).await {
        Ok(Some(_)) => Ok(agent_id),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Unknown agent").into_response()),
        Err(e) => {
            tracing::error!(agent_id, "Directory lookup failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Text payload of a frame, `None` for frames to skip.
fn frame_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(data) => String::from_utf8(data.to_vec()).ok(),
        _ => None,
    }
}

/// Forward queued text frames to the socket until either side goes away.
fn spawn_writer(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}

/// `GET /api/ws/agent?agentId=<id>`
pub async fn agent_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<AgentQuery>,
    State(state): State<AppState>,
) -> Response {
    let agent_id = match known_agent(&state, &query).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_agent_socket(socket: WebSocket, state: AppState, agent_id: AgentId) {
    let (sender, mut receiver) = socket.split();
    let (handle, rx) = SessionHandle::channel();
    let send_task = spawn_writer(sender, rx);

    let mut conn = state.sessions.connect(agent_id, handle);
    conn.open();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Close(_)) => break,
            Ok(msg) => match frame_text(msg) {
                Some(text) => text,
                None => continue,
            },
            Err(e) => {
                tracing::warn!(agent_id, "Agent socket error: {e}");
                break;
            }
        };
        tracing::debug!(agent_id, len = text.len(), "Agent frame");
        conn.on_frame(&text);
    }

    conn.close();
    send_task.abort();
}

/// Apply one observer control message.
///
/// # Errors
/// Returns the message to report back to the observer.
pub fn apply_control(
    shells: &ShellMultiplexer,
    agent_id: AgentId,
    observer: &ObserverHandle,
    text: &str,
) -> Result<(), String> {
    let control: ShellControl =
        serde_json::from_str(text).map_err(|e| format!("Invalid message: {e}"))?;

    let result = match control {
        ShellControl::ShellStart { cols, rows } => shells.start(agent_id, observer, cols, rows),
        ShellControl::ShellInput { data } => shells.input(agent_id, &data),
        ShellControl::ShellResize { cols, rows } => shells.resize(agent_id, cols, rows),
        ShellControl::ShellStop { .. } => {
            shells.stop(agent_id, observer.id());
            Ok(())
        }
    };
    result.map_err(|e| e.to_string())
}

/// `GET /api/ws/shell?agentId=<id>`
pub async fn shell_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<AgentQuery>,
    State(state): State<AppState>,
) -> Response {
    let agent_id = match known_agent(&state, &query).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_shell_socket(socket, state, agent_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_shell_socket(socket: WebSocket, state: AppState, agent_id: AgentId) {
    let (sender, mut receiver) = socket.split();
    let (observer, rx) = ObserverHandle::channel();
    let send_task = spawn_writer(sender, rx);
    let shells = state.sessions.shells();

    tracing::info!(agent_id, observer_id = %observer.id(), "Shell observer connected");

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Close(_)) => break,
            Ok(msg) => match frame_text(msg) {
                Some(text) => text,
                None => continue,
            },
            Err(e) => {
                tracing::warn!(agent_id, "Shell socket error: {e}");
                break;
            }
        };

        if let Err(message) = apply_control(shells, agent_id, &observer, &text) {
            tracing::warn!(agent_id, observer_id = %observer.id(), "Shell control rejected: {message}");
            observer.send(shell_error(&message));
        }
    }

    shells.stop(agent_id, observer.id());
    send_task.abort();
    tracing::info!(agent_id, observer_id = %observer.id(), "Shell observer disconnected");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use horizon_core::AgentRequest;
    use horizon_session::SessionManager;

    use super::*;

    fn setup() -> (
        SessionManager,
        horizon_session::AgentConnection,
        mpsc::UnboundedReceiver<String>,
    ) {
        let manager = SessionManager::new(Duration::from_secs(30));
        let (handle, rx) = SessionHandle::channel();
        let mut conn = manager.connect(1, handle);
        conn.open();
        (manager, conn, rx)
    }

    #[test]
    fn test_start_then_input() {
        let (manager, _conn, mut rx) = setup();
        let shells: &Arc<ShellMultiplexer> = manager.shells();
        let (observer, _obs_rx) = ObserverHandle::channel();

        apply_control(shells, 1, &observer, r#"{"type":"shell_start"}"#).unwrap();
        apply_control(shells, 1, &observer, r#"{"type":"shell_input","data":"ls\r"}"#).unwrap();

        let start: AgentRequest = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(start, AgentRequest::shell_start(80, 24));
        let input: AgentRequest = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(input, AgentRequest::ShellInput { data: "ls\r".into() });
    }

    #[test]
    fn test_malformed_and_unknown_messages() {
        let (manager, _conn, _rx) = setup();
        let (observer, _obs_rx) = ObserverHandle::channel();

        let err = apply_control(manager.shells(), 1, &observer, "{oops").unwrap_err();
        assert!(err.starts_with("Invalid message"));
        assert!(apply_control(manager.shells(), 1, &observer, r#"{"type":"reboot"}"#).is_err());
        assert!(
            apply_control(manager.shells(), 1, &observer, r#"{"type":"shell_input","data":""}"#)
                .is_err()
        );
    }

    #[test]
    fn test_offline_agent_reported() {
        let manager = SessionManager::new(Duration::from_secs(30));
        let (observer, _obs_rx) = ObserverHandle::channel();

        let err = apply_control(manager.shells(), 4, &observer, r#"{"type":"shell_start"}"#)
            .unwrap_err();
        assert_eq!(err, "Agent is offline");
    }

    #[test]
    fn test_stop_detaches() {
        let (manager, _conn, mut rx) = setup();
        let (observer, _obs_rx) = ObserverHandle::channel();

        apply_control(manager.shells(), 1, &observer, r#"{"type":"shell_start","cols":100,"rows":40}"#)
            .unwrap();
        apply_control(manager.shells(), 1, &observer, r#"{"type":"shell_stop","data":""}"#).unwrap();

        assert_eq!(manager.shells().observer_count(1), 0);
        rx.try_recv().unwrap();
        let stop: AgentRequest = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(stop, AgentRequest::shell_stop());
    }
}

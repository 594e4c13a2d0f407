//! JSON HTTP endpoints.

use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use horizon_core::{AgentId, MetricsError, MetricsSample, MetricsSink};

use crate::{
    AppState,
    protocol::{ApiResponse, CommandRequest, CommandResponse, PushRequest, RegisterRequest},
};

/// Map a metrics error onto the envelope.
pub fn metrics_error(err: MetricsError) -> Response {
    let status = match &err {
        MetricsError::UnknownAgent(_) | MetricsError::UnregisteredNode(_) => StatusCode::NOT_FOUND,
        MetricsError::InvalidKey => StatusCode::UNAUTHORIZED,
        MetricsError::Directory(_) | MetricsError::Store(_) => {
            tracing::error!("Metrics request failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiResponse::<()>::error(err.to_string()))).into_response()
}

/// Best guess at the caller's address: forwarding headers first.
fn client_address(headers: &HeaderMap, extensions: &Extensions) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_owned();
        }
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_owned();
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "service": "horizon",
        "timestamp": Utc::now(),
    }))
}

fn command_reply(status: StatusCode, result: CommandResponse) -> Response {
    (status, Json(result)).into_response()
}

/// `POST /api/agents/{agentId}/command`
pub async fn execute_command(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let command = match body {
        Ok(Json(request)) => request.command,
        Err(e) => {
            return command_reply(
                StatusCode::BAD_REQUEST,
                CommandResponse::failure(e.body_text(), 1),
            );
        }
    };
    if command.trim().is_empty() {
        return command_reply(StatusCode::OK, CommandResponse::failure("Command cannot be empty", 1));
    }
    let Ok(agent_id) = agent_id.trim().parse::<AgentId>() else {
        return command_reply(
            StatusCode::BAD_REQUEST,
            CommandResponse::failure("Invalid agent ID", 1),
        );
    };

    match state.metrics.directory().find_by_id(agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return command_reply(
                StatusCode::NOT_FOUND,
                CommandResponse::failure(format!("Agent not found: {agent_id}"), 1),
            );
        }
        Err(e) => {
            tracing::error!(agent_id, "Directory lookup failed: {e}");
            return command_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                CommandResponse::failure(format!("Command execution failed: {e}"), -1),
            );
        }
    }

    tracing::info!(agent_id, "Executing command");
    match state.sessions.execute(agent_id, &command).await {
        Ok(result) => command_reply(StatusCode::OK, result),
        Err(e) => {
            tracing::warn!(agent_id, exit_code = e.exit_code(), "Command failed: {e}");
            command_reply(StatusCode::OK, e.into_result())
        }
    }
}

/// `POST /api/agent/register`
pub async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let address = client_address(&headers, &extensions);
    tracing::debug!(node_id = %request.node_id, %address, "Agent registration request");

    let (key, registration) = request.into_parts(address);
    match state.metrics.register(&key, registration).await {
        Ok(agent) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(agent, "Agent registered successfully")),
        )
            .into_response(),
        Err(e) => metrics_error(e),
    }
}

/// `POST /api/agent/push`
pub async fn push_metrics(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Response {
    match state.metrics.push(&request.key, &request.metrics).await {
        Ok(_) => Json(ApiResponse::ok("Metrics received successfully")).into_response(),
        Err(e) => metrics_error(e),
    }
}

/// `POST /metrics/agents/{agentId}`
pub async fn ingest_metrics(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
    Json(sample): Json<MetricsSample>,
) -> Response {
    match state.metrics.ingest(agent_id, sample).await {
        Ok(snapshot) => Json(ApiResponse::success(snapshot, "Metrics received successfully"))
            .into_response(),
        Err(e) => metrics_error(e),
    }
}

/// `GET /metrics/realtime/{agentId}`
pub async fn realtime(State(state): State<AppState>, Path(agent_id): Path<AgentId>) -> Response {
    match state.metrics.get(agent_id).await {
        Ok(snapshot) => Json(ApiResponse::success(snapshot, "OK")).into_response(),
        Err(e) => metrics_error(e),
    }
}

/// `GET /metrics/realtime`
pub async fn realtime_all(State(state): State<AppState>) -> Response {
    match state.metrics.get_all().await {
        Ok(snapshots) => Json(ApiResponse::success(snapshots, "OK")).into_response(),
        Err(e) => metrics_error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use horizon_core::{
        AgentDirectory, AgentIdentity, BroadcastHub, ClientIdentity, SnapshotCache,
    };
    use horizon_session::{
        MetricsService, SessionHandle, SessionManager,
        storage::{MemoryDirectory, MemoryMetricsStore, StaticKeyValidator},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::router;

    fn state() -> AppState {
        let directory = Arc::new(MemoryDirectory::with_agents([
            AgentIdentity::new(1, "web-1", "10.0.0.1"),
            AgentIdentity::new(2, "db-1", "10.0.0.2"),
        ]));
        let keys = StaticKeyValidator::new([(
            "secret".to_owned(),
            ClientIdentity {
                id: 1,
                user_id: None,
                name: "ops".into(),
            },
        )]);
        let metrics = MetricsService::new(
            directory as Arc<dyn AgentDirectory>,
            Arc::new(MemoryMetricsStore::new(100)),
            Arc::new(keys),
            Arc::new(SnapshotCache::new(Duration::from_secs(60))),
            Arc::new(BroadcastHub::default()),
        );
        AppState {
            sessions: Arc::new(SessionManager::new(Duration::from_secs(30))),
            metrics: Arc::new(metrics),
            subscriber_timeout: Duration::from_millis(50),
        }
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, json) = call(router(state()), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "UP");
    }

    #[tokio::test]
    async fn test_ingest_then_realtime() {
        let state = state();
        let (status, json) = call(
            router(state.clone()),
            Method::POST,
            "/metrics/agents/1",
            Some(serde_json::json!({"cpuUsage": 50, "memoryTotal": 1000, "memoryUsed": 250})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let (status, json) = call(router(state.clone()), Method::GET, "/metrics/realtime/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["online"], true);
        assert_eq!(json["data"]["memoryUsage"], 25.0);

        let (_, json) = call(router(state), Method::GET, "/metrics/realtime", None).await;
        let all = json["data"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1]["online"], false);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_404() {
        let (status, json) = call(router(state()), Method::GET, "/metrics/realtime/77", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_register_and_push() {
        let state = state();
        let (status, _) = call(
            router(state.clone()),
            Method::POST,
            "/api/agent/register",
            Some(serde_json::json!({"key": "bogus", "nodeId": "n1"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let app = router(state.clone());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/agent/register")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::from(
                serde_json::json!({"key": "secret", "nodeId": "n1", "hostname": "edge-1"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"]["address"], "203.0.113.7");
        let agent_id = json["data"]["id"].as_i64().unwrap();

        let (status, _) = call(
            router(state.clone()),
            Method::POST,
            "/api/agent/push",
            Some(serde_json::json!({"key": "secret", "metrics": {"nodeId": "n1", "cpu": 5.0}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let snapshot = state.metrics.get(agent_id).await.unwrap();
        assert!(snapshot.online);
        assert_eq!(snapshot.cpu_usage, Some(5.0));
    }

    #[tokio::test]
    async fn test_command_rejections() {
        let state = state();

        let (status, json) = call(
            router(state.clone()),
            Method::POST,
            "/api/agents/1/command",
            Some(serde_json::json!({"command": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["exitCode"], 1);

        let (status, json) = call(
            router(state.clone()),
            Method::POST,
            "/api/agents/abc/command",
            Some(serde_json::json!({"command": "ls"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Invalid agent ID");

        let (status, _) = call(
            router(state.clone()),
            Method::POST,
            "/api/agents/99/command",
            Some(serde_json::json!({"command": "ls"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = call(
            router(state),
            Method::POST,
            "/api/agents/1/command",
            Some(serde_json::json!({"command": "ls"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["error"], "Agent is offline");
        assert_eq!(json["exitCode"], 1);
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let state = state();
        let (handle, mut rx) = SessionHandle::channel();
        let mut conn = state.sessions.connect(1, handle);
        conn.open();

        let agent = tokio::spawn(async move {
            let text = rx.recv().await.unwrap();
            let frame: Value = serde_json::from_str(&text).unwrap();
            conn.on_frame(
                &serde_json::json!({
                    "type": "command_result",
                    "requestId": frame["requestId"],
                    "output": "hello\n",
                    "error": "",
                    "code": 0,
                })
                .to_string(),
            );
            conn
        });

        let (status, json) = call(
            router(state),
            Method::POST,
            "/api/agents/1/command",
            Some(serde_json::json!({"command": "echo hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["output"], "hello\n");
        assert_eq!(json["exitCode"], 0);
        drop(agent.await.unwrap());
    }

    #[tokio::test]
    async fn test_agent_socket_requires_known_agent() {
        for uri in ["/api/ws/agent", "/api/ws/agent?agentId=x", "/api/ws/agent?agentId=42"] {
            let (status, _) = call(router(state()), Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
        let (status, _) = call(router(state()), Method::GET, "/api/ws/shell?agentId=42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_starts_with_init_and_ends() {
        let app = router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics/stream/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("event: init\n"));
        assert!(text.contains(r#""agentId":1"#));
    }
}

//! Server-sent event streams of realtime metrics.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response, Sse},
};
use horizon_core::AgentId;

use crate::{AppState, http::metrics_error};

/// `GET /metrics/stream`
pub async fn stream_all(State(state): State<AppState>) -> Response {
    match state.metrics.subscribe_all().await {
        Ok(subscription) => {
            tracing::debug!(sink_id = %subscription.id(), "New metrics stream for all agents");
            Sse::new(subscription.sse_stream(state.subscriber_timeout)).into_response()
        }
        Err(e) => metrics_error(e),
    }
}

/// `GET /metrics/stream/{agentId}`
pub async fn stream_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
) -> Response {
    match state.metrics.subscribe(agent_id).await {
        Ok(subscription) => {
            tracing::debug!(agent_id, sink_id = %subscription.id(), "New metrics stream");
            Sse::new(subscription.sse_stream(state.subscriber_timeout)).into_response()
        }
        Err(e) => metrics_error(e),
    }
}

//! Transport layer of the Horizon backend.
//!
//! Provides:
//! - Wire protocol of the HTTP API and shell observers
//! - HTTP, SSE and WebSocket endpoints (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod sse;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ApiResponse, CommandRequest, CommandResponse, ShellControl};

#[cfg(feature = "websocket")]
pub use app::{AppState, router};

#[cfg(feature = "websocket")]
mod app {
    use std::{sync::Arc, time::Duration};

    use axum::{
        Router,
        routing::{get, post},
    };
    use horizon_session::{MetricsService, SessionManager};
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    use crate::{http, sse, websocket};

    /// Shared state of every handler.
    #[derive(Clone)]
    pub struct AppState {
        pub sessions: Arc<SessionManager>,
        pub metrics: Arc<MetricsService>,
        /// Lifetime of one SSE stream.
        pub subscriber_timeout: Duration,
    }

    /// Build the full HTTP surface.
    #[must_use]
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(http::health))
            .route("/api/agents/{agentId}/command", post(http::execute_command))
            .route("/api/agent/register", post(http::register_agent))
            .route("/api/agent/push", post(http::push_metrics))
            .route("/metrics/agents/{agentId}", post(http::ingest_metrics))
            .route("/metrics/realtime", get(http::realtime_all))
            .route("/metrics/realtime/{agentId}", get(http::realtime))
            .route("/metrics/stream", get(sse::stream_all))
            .route("/metrics/stream/{agentId}", get(sse::stream_agent))
            .route("/api/ws/agent", get(websocket::agent_ws_handler))
            .route("/api/ws/shell", get(websocket::shell_ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

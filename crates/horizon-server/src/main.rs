//! Horizon fleet monitoring backend.
//!
//! Run with: cargo run -p horizon-server -- --agents agents.json --keys keys.json

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use horizon_core::{
    AgentDirectory, AgentIdentity, BroadcastHub, ClientIdentity, MetricsSink, Settings,
    SnapshotCache,
};
use horizon_poller::{HttpMetricsSource, PollConfig, PollScheduler};
use horizon_session::{
    MetricsService, SessionManager,
    storage::{MemoryDirectory, MemoryMetricsStore, StaticKeyValidator},
};
use horizon_transport::{AppState, router};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "horizon", about = "Realtime metrics and remote command backend")]
struct Args {
    /// Listen address.
    #[arg(long, env = "HORIZON_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// JSON array of agents to seed the directory with.
    #[arg(long, env = "HORIZON_AGENTS")]
    agents: Option<PathBuf>,

    /// JSON object mapping client keys to clients.
    #[arg(long, env = "HORIZON_KEYS")]
    keys: Option<PathBuf>,

    #[arg(long, env = "HORIZON_FRESHNESS_TTL_SECS")]
    freshness_ttl_secs: Option<u64>,
    #[arg(long, env = "HORIZON_HEARTBEAT_INTERVAL_SECS")]
    heartbeat_interval_secs: Option<u64>,
    #[arg(long, env = "HORIZON_RECONCILE_INTERVAL_SECS")]
    reconcile_interval_secs: Option<u64>,
    #[arg(long, env = "HORIZON_POLL_TIMEOUT_MS")]
    poll_timeout_ms: Option<u64>,
    #[arg(long, env = "HORIZON_DEFAULT_POLL_INTERVAL_MS")]
    default_poll_interval_ms: Option<u64>,
    #[arg(long, env = "HORIZON_DEFAULT_AGENT_PORT")]
    default_agent_port: Option<u16>,
    #[arg(long, env = "HORIZON_COMMAND_TIMEOUT_SECS")]
    command_timeout_secs: Option<u64>,
    #[arg(long, env = "HORIZON_SUBSCRIBER_TIMEOUT_SECS")]
    subscriber_timeout_secs: Option<u64>,
    #[arg(long, env = "HORIZON_SINK_CAPACITY")]
    sink_capacity: Option<usize>,
    #[arg(long, env = "HORIZON_HISTORY_LIMIT")]
    history_limit: Option<usize>,
}

impl Args {
    /// Overlay the given flags on the default settings.
    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    settings.$field = value;
                })*
            };
        }
        overlay!(
            freshness_ttl_secs,
            heartbeat_interval_secs,
            reconcile_interval_secs,
            poll_timeout_ms,
            default_poll_interval_ms,
            default_agent_port,
            command_timeout_secs,
            subscriber_timeout_secs,
            sink_capacity,
            history_limit,
        );
        settings
    }
}

fn load_agents(path: &Path) -> anyhow::Result<Vec<AgentIdentity>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading agent file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing agent file {}", path.display()))
}

fn load_keys(path: &Path) -> anyhow::Result<HashMap<String, ClientIdentity>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing key file {}", path.display()))
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            tracing::info!("Shutdown requested");
            cancel.cancel();
        }
        () = cancel.cancelled() => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let settings = args.settings();
    tracing::debug!(?settings, "Loaded settings");

    let agents = args.agents.as_deref().map(load_agents).transpose()?.unwrap_or_default();
    let keys = args.keys.as_deref().map(load_keys).transpose()?.unwrap_or_default();
    tracing::info!(agents = agents.len(), clients = keys.len(), "Seeded directory");

    let directory: Arc<dyn AgentDirectory> = Arc::new(MemoryDirectory::with_agents(agents));
    let hub = Arc::new(BroadcastHub::new(settings.sink_capacity));
    let metrics = Arc::new(MetricsService::new(
        Arc::clone(&directory),
        Arc::new(MemoryMetricsStore::new(settings.history_limit)),
        Arc::new(StaticKeyValidator::new(keys)),
        Arc::new(SnapshotCache::new(settings.freshness_ttl())),
        Arc::clone(&hub),
    ));
    let sessions = Arc::new(SessionManager::new(settings.command_timeout()));

    let source = HttpMetricsSource::new(settings.poll_timeout(), settings.default_agent_port)
        .context("building metrics client")?;
    let scheduler = Arc::new(PollScheduler::new(
        Arc::clone(&directory),
        Arc::new(source),
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        PollConfig::from(&settings),
    ));

    let cancel = CancellationToken::new();
    let heartbeat = Arc::clone(&hub).spawn_heartbeat(settings.heartbeat_interval());
    let poller = scheduler.run(cancel.clone());
    let reclaim = Arc::clone(&metrics).spawn_reclaim(settings.reconcile_interval(), cancel.clone());

    let app = router(AppState {
        sessions,
        metrics,
        subscriber_timeout: settings.subscriber_timeout(),
    });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    tracing::info!("Server listening on http://{}", args.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await
    .context("serving HTTP")?;

    cancel.cancel();
    heartbeat.abort();
    if let Err(e) = poller.await {
        tracing::warn!("Poll scheduler ended abnormally: {e}");
    }
    if let Err(e) = reclaim.await {
        tracing::warn!("Snapshot reclaim ended abnormally: {e}");
    }
    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_flags_overlay_defaults() {
        let args = Args::parse_from([
            "horizon",
            "--freshness-ttl-secs",
            "5",
            "--sink-capacity",
            "8",
        ]);
        let settings = args.settings();
        assert_eq!(settings.freshness_ttl_secs, 5);
        assert_eq!(settings.sink_capacity, 8);
        assert_eq!(settings.command_timeout_secs, Settings::default().command_timeout_secs);
    }

    #[test]
    fn test_load_seed_files() {
        let mut agents = tempfile::NamedTempFile::new().unwrap();
        write!(
            agents,
            r#"[{{"id":1,"name":"web-1","address":"10.0.0.1","pollIntervalMs":500}}]"#
        )
        .unwrap();
        let loaded = load_agents(agents.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].poll_interval_ms, Some(500));

        let mut keys = tempfile::NamedTempFile::new().unwrap();
        write!(keys, r#"{{"k1":{{"id":7,"name":"ops"}}}}"#).unwrap();
        let loaded = load_keys(keys.path()).unwrap();
        assert_eq!(loaded["k1"].id, 7);
    }

    #[test]
    fn test_bad_seed_file_reports_path() {
        let mut agents = tempfile::NamedTempFile::new().unwrap();
        write!(agents, "not json").unwrap();
        let err = load_agents(agents.path()).unwrap_err();
        assert!(err.to_string().contains("parsing agent file"));
    }
}

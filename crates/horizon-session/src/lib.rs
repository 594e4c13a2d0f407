//! Agent sessions, command correlation and metrics ingestion.
//!
//! Provides:
//! - `ConnectionRegistry` - Live agent sessions
//! - `CommandCorrelator` - Tokenized command round-trips with deadlines
//! - `ShellMultiplexer` - One agent shell mirrored to many observers
//! - `SessionManager` - Connection state machine wiring the above together
//! - `MetricsService` - Push/poll ingestion and realtime queries
//! - Collaborator implementations (memory)

pub mod correlator;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod shell;
pub mod storage;

pub use correlator::{CommandCorrelator, CommandError};
pub use manager::{AgentConnection, ConnectionState, SessionManager};
pub use metrics::MetricsService;
pub use registry::{AgentSession, ConnectionRegistry, SessionError, SessionHandle, SessionId};
pub use shell::{ObserverHandle, ObserverId, ShellError, ShellMultiplexer, ShellState};

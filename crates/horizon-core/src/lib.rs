//! Core types for the Horizon realtime agent layer.
//!
//! This crate provides the fundamental building blocks:
//! - `SnapshotCache` - Latest metrics per agent with a freshness TTL
//! - `BroadcastHub` - Fan-out of snapshots and heartbeats to subscribers
//! - `AgentRequest` / `AgentReply` - Frames exchanged with agents
//! - Collaborator traits (`AgentDirectory`, `MetricsStore`, `KeyValidator`, `MetricsSink`)
//! - `Settings` - Shared tunables

pub mod cache;
pub mod frame;
pub mod hub;
pub mod metrics;
pub mod settings;
pub mod snapshot;
pub mod traits;

pub use cache::SnapshotCache;
pub use frame::{AgentReply, AgentRequest, CommandResult, RequestId};
pub use hub::{BroadcastHub, HubEvent, Scope, SinkId, Subscription};
pub use metrics::{AgentReport, MetricsSample};
pub use settings::Settings;
pub use snapshot::RealtimeSnapshot;
pub use traits::{
    AgentDirectory, AgentId, AgentIdentity, AgentMode, AgentRegistration, ClientIdentity,
    KeyValidator, MetricsError, MetricsSink, MetricsStore,
};

//! Fallback metrics polling for agents without a push channel.
//!
//! Provides:
//! - `MetricsSource` trait and the HTTP implementation
//! - `PollScheduler` - One periodic pull per poll-mode agent, reconciled
//!   against the agent directory

pub mod client;
pub mod scheduler;

pub use client::{HttpMetricsSource, MetricsSource, PollError};
pub use scheduler::{PollConfig, PollScheduler, ReconcileReport, poll_once};

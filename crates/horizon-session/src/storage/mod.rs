//! Collaborator implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryDirectory, MemoryMetricsStore, StaticKeyValidator, StoredSample};

//! Error types for the environment abstraction layer.

use thiserror::Error;

/// Errors surfaced by environment collaborators.
///
/// All of these are transient from the pipeline's point of view: scanners
/// stall, audio devices are busy, registries flap. The core logs and retries;
/// none of them invalidate pipeline state.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Scanner produced no data for longer than its stall budget.
    #[error("scanner stalled: {0}")]
    ScannerStalled(String),

    /// Audio device could not play or record.
    #[error("acoustic device error: {0}")]
    AcousticDevice(String),

    /// Service registry failed to announce or browse.
    #[error("service registry error: {0}")]
    Registry(String),

    /// Operation exceeded its deadline.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Channel to the collaborator closed (shutdown).
    #[error("collaborator channel closed")]
    Closed,
}

impl EnvError {
    /// Creates an acoustic device error.
    pub fn acoustic(msg: impl Into<String>) -> Self {
        Self::AcousticDevice(msg.into())
    }

    /// Creates a registry error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }
}

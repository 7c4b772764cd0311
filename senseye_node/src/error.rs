//! Node-level error type.

use senseye_core::CalibrationError;
use senseye_env::EnvError;
use thiserror::Error;

/// Errors that surface out of the runtime. Everything transient inside a
/// fusion cycle is handled locally; only startup, persistence, and
/// calibration failures reach the caller.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("floorplan file is corrupt: {0}")]
    CorruptFloorPlan(String),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

//! Node configuration assembled from the CLI.
//!
//! Invalid configuration fails fast at startup (exit code 1); everything
//! here is validated before any socket is opened.

use std::net::SocketAddr;
use std::str::FromStr;

use senseye_env::{NodeId, Role};

use crate::error::NodeError;
use crate::protocol;

/// When and how often the node performs acoustic calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcousticMode {
    /// Never chirp.
    Off,
    /// Chirp only when `calibrate` is invoked.
    #[default]
    OnDemand,
    /// Scheduled every 10 minutes.
    Every10m,
    /// Scheduled every hour.
    Every1h,
}

impl AcousticMode {
    /// Scheduled interval, when one exists.
    pub fn interval_s(&self) -> Option<f64> {
        match self {
            AcousticMode::Every10m => Some(600.0),
            AcousticMode::Every1h => Some(3600.0),
            AcousticMode::Off | AcousticMode::OnDemand => None,
        }
    }
}

impl FromStr for AcousticMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(AcousticMode::Off),
            "on-demand" => Ok(AcousticMode::OnDemand),
            "10m" => Ok(AcousticMode::Every10m),
            "1h" => Ok(AcousticMode::Every1h),
            other => Err(format!(
                "unknown acoustic mode {other:?} (expected off, on-demand, 10m, 1h)"
            )),
        }
    }
}

/// Complete runtime configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: NodeId,
    pub role: Role,
    pub port: u16,
    /// Static peer list used when no mDNS collaborator is wired in.
    pub peers: Vec<SocketAddr>,
    pub headless: bool,
    pub acoustic: AcousticMode,

    /// Pipeline cycle interval, seconds.
    pub pipeline_interval_s: f64,

    /// Belief staleness horizon, seconds.
    pub stale_horizon_s: f64,

    /// Maximum wire frame length, bytes.
    pub max_frame_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: NodeId::new("senseye"),
            role: Role::Fixed,
            port: protocol::DEFAULT_PORT,
            peers: Vec::new(),
            headless: false,
            acoustic: AcousticMode::default(),
            pipeline_interval_s: 1.0,
            stale_horizon_s: 10.0,
            max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NodeConfig {
    /// Startup validation; any failure here is fatal.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.name.as_str().is_empty() {
            return Err(NodeError::config("node name must not be empty"));
        }
        if self.port == 0 {
            return Err(NodeError::config("gossip port must not be 0"));
        }
        if !(self.pipeline_interval_s > 0.0) {
            return Err(NodeError::config("pipeline interval must be positive"));
        }
        if !(self.stale_horizon_s > self.pipeline_interval_s) {
            return Err(NodeError::config(
                "staleness horizon must exceed the pipeline interval",
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(NodeError::config("max frame size must be at least 1 KiB"));
        }
        Ok(())
    }
}

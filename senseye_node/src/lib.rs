//! Senseye node runtime: the agent every device runs.
//!
//! Hosts the pipeline `SCAN -> FILTER -> INFER -> SHARE <-> FUSE -> WORLD`
//! around the engines in `senseye_core`: a TCP gossip mesh with
//! newline-delimited JSON frames carries beliefs between peers, a bounded
//! dedup table keeps relays loop-free, and a once-per-second cycle fuses
//! the held beliefs into a world snapshot for the renderer.

pub mod calibrate;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gossip;
pub mod pipeline;
pub mod protocol;
pub mod store;

pub use config::{AcousticMode, NodeConfig};
pub use dedup::{DedupOutcome, DedupTable};
pub use error::NodeError;
pub use gossip::{BeliefRouter, GossipConfig, GossipMesh, MeshEvent, RouteDecision};
pub use pipeline::NodeRuntime;
pub use protocol::{DecodeOutcome, WireMessage, DEFAULT_PORT};
pub use store::{FloorPlanStore, JsonFloorPlanStore};

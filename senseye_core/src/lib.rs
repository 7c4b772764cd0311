//! Senseye Core - Uncertainty-Aware Distributed Indoor Sensing
//!
//! The numeric heart of a Senseye node, pure of I/O. Five engines share a
//! single confidence-to-precision contract:
//!
//! 1. **Kalman bank**: one adaptive 2-state filter per RF signal path
//! 2. **Local inference**: filtered paths to a confidence-tagged Belief
//! 3. **Consensus fusion**: inverse-variance averaging across peers with a
//!    disagreement penalty
//! 4. **Robust trilateration**: Tukey-weighted IRLS with subset outlier
//!    rejection
//! 5. **Weighted ridge tomography**: link attenuations to a per-cell field
//!
//! The calibration orchestrator (ranging fusion + MDS layout + wall and
//! room detection) builds the static floorplan; the world state keeps the
//! live motion overlay on top of it. The gossip fabric that moves beliefs
//! between nodes lives in `senseye_node`.

pub mod acoustic;
pub mod belief;
pub mod calibration;
pub mod confidence;
pub mod floorplan;
pub mod fusion;
pub mod inference;
pub mod kalman;
pub mod propagation;
pub mod tomography;
pub mod trilateration;
pub mod world;

// Re-export key types for convenience
pub use belief::{Belief, DeviceBelief, LinkBelief, PairKey, ZoneBelief};
pub use calibration::{CalibrationConfig, CalibrationError, CalibrationInputs};
pub use floorplan::{FloorPlan, GridGeometry, Room, Topology, WallGrid};
pub use fusion::{ConsensusFusion, FusedWorld, FusionConfig};
pub use inference::{InferenceConfig, LocalInference};
pub use kalman::{FilterBank, KalmanConfig, PathKey};
pub use tomography::{AttenuationField, TomographyConfig, TomographyError};
pub use trilateration::{Anchor, Fix, TrilaterationConfig, TrilaterationError};
pub use world::{
    CalibrationStatus, NodeHealth, RecalibrationTrigger, WorldConfig, WorldSnapshot, WorldState,
};

//! Senseye Environment Abstraction Layer
//!
//! This crate is the "Sans-IO" boundary of Senseye: the sensing and fusion
//! pipeline in `senseye_core` never touches a WiFi stack, an audio device,
//! or an mDNS daemon directly. It talks to the traits defined here, and the
//! node runtime injects an implementation:
//!
//! - Time (`now()`, `sleep()`) via [`SenseContext`]
//! - Signal acquisition via [`Scanner`] and [`AcousticDevice`]
//! - Peer discovery via [`ServiceRegistry`]
//!
//! The production implementation is [`TokioContext`]; tests and the bundled
//! binary use the channel-backed [`ChannelScanner`] and [`StaticRegistry`],
//! which keep every collaborator deterministic and injectable.

mod collab;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use collab::{
    AcousticDevice, ChannelScanner, NullAcousticDevice, Scanner, ScannerHandle, ServiceRegistry,
    StaticRegistry,
};
pub use context::SenseContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::{Measurement, NodeId, PcmCapture, PeerEvent, Role, SignalKind};

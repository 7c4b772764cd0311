//! Common types shared between the environment layer and the core pipeline.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique identifier for a Senseye node or an observed RF device.
///
/// Node ids are operator-assigned strings (hostnames by default), so they
/// survive restarts and are human-readable in logs and on the wire. The `|`
/// character is reserved for the unordered-pair map key encoding and is
/// stripped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a NodeId from any displayable name.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        if name.contains('|') {
            Self(name.replace('|', "_"))
        } else {
            Self(name)
        }
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Whether a node is installed at a fixed location or carried around.
///
/// Fixed nodes are the trilateration anchors; mobile nodes are positioned
/// relative to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Fixed,
    Mobile,
}

/// The physical channel a measurement was taken on.
///
/// Each kind carries its own noise model and confidence formula downstream,
/// but the pipeline treats all three uniformly (tagged variant, no
/// inheritance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Wifi,
    Ble,
    Acoustic,
}

impl SignalKind {
    /// True for the RF kinds whose `value` is an RSSI in dBm.
    pub fn is_rf(&self) -> bool {
        matches!(self, SignalKind::Wifi | SignalKind::Ble)
    }
}

/// A single timestamped observation of one signal path.
///
/// Immutable; consumed exactly once by the filter bank. For RF kinds
/// `value` is RSSI in dBm (negative), for acoustic it is a ranged distance
/// in meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Observing node (always the local node for scanner output).
    pub source: NodeId,
    /// Observed node or device.
    pub target: NodeId,
    /// Physical channel.
    pub kind: SignalKind,
    /// Wall-clock capture time, seconds since the Unix epoch.
    pub timestamp_s: f64,
    /// RSSI dBm or distance meters, depending on `kind`.
    pub value: f64,
    /// Matched-filter peak SNR for acoustic measurements.
    pub snr: Option<f64>,
}

/// Peer membership change reported by the service registry.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Joined {
        node: NodeId,
        addr: SocketAddr,
        role: Role,
        position: Option<[f64; 2]>,
    },
    Left {
        node: NodeId,
    },
}

/// A raw audio capture returned by an [`crate::AcousticDevice`].
#[derive(Debug, Clone)]
pub struct PcmCapture {
    /// Mono samples, normalized to [-1, 1].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Wall-clock time of the first sample, seconds since the Unix epoch.
    pub capture_start_s: f64,
}

impl PcmCapture {
    /// Capture length in seconds.
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_strips_reserved_separator() {
        let id = NodeId::new("kitchen|pi");
        assert_eq!(id.as_str(), "kitchen_pi");
    }

    #[test]
    fn signal_kind_rf_classification() {
        assert!(SignalKind::Wifi.is_rf());
        assert!(SignalKind::Ble.is_rf());
        assert!(!SignalKind::Acoustic.is_rf());
    }

    #[test]
    fn measurement_json_round_trip() {
        let m = Measurement {
            source: NodeId::new("a"),
            target: NodeId::new("b"),
            kind: SignalKind::Ble,
            timestamp_s: 1700000000.25,
            value: -61.5,
            snr: None,
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}

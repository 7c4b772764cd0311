//! The belief data model gossiped between nodes.
//!
//! A `Belief` is one node's current view of its RF neighborhood: link
//! attenuations, observed devices, and zone activity, each tagged with a
//! confidence that downstream fusion converts to a precision weight. The
//! JSON shape here is the wire shape; compatibility is maintained by
//! additive fields only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use senseye_env::NodeId;

/// Unordered pair of node ids, used as the link map key.
///
/// Stored ordered so `(a, b)` and `(b, a)` collide, and serialized as the
/// string `"a|b"` so it can key a JSON map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PairKey {
    a: NodeId,
    b: NodeId,
}

impl PairKey {
    pub fn new(x: NodeId, y: NodeId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn a(&self) -> &NodeId {
        &self.a
    }

    pub fn b(&self) -> &NodeId {
        &self.b
    }

    /// True when `node` is one of the endpoints.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.a == node || &self.b == node
    }

    /// The endpoint opposite `node`, if `node` is an endpoint.
    pub fn other(&self, node: &NodeId) -> Option<&NodeId> {
        if &self.a == node {
            Some(&self.b)
        } else if &self.b == node {
            Some(&self.a)
        } else {
            None
        }
    }
}

impl From<PairKey> for String {
    fn from(key: PairKey) -> Self {
        format!("{}|{}", key.a, key.b)
    }
}

impl TryFrom<String> for PairKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('|') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() => {
                Ok(PairKey::new(NodeId::new(a), NodeId::new(b)))
            }
            _ => Err(format!("malformed pair key: {value:?}")),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

/// Belief about one link between two positioned nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBelief {
    /// Excess attenuation over the propagation model, dB, never negative.
    pub attenuation_db: f64,
    /// Probability that something is moving through the path.
    pub motion_prob: f64,
    /// Confidence in this estimate, (0, 1).
    pub confidence: f64,
}

/// Belief about one observed (non-mesh) RF device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBelief {
    /// Filtered RSSI, dBm.
    pub rssi_dbm: f64,
    /// Distance implied by the path-loss model, meters, > 0.
    pub estimated_distance_m: f64,
    /// Whether the path variance indicates motion.
    pub moving: bool,
    /// Confidence in this estimate, (0, 1).
    pub confidence: f64,
}

/// Belief about one zone (room) of the floorplan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneBelief {
    pub occupied_prob: f64,
    pub motion_prob: f64,
}

/// One emission of a node's local world view.
///
/// `sequence_number` is strictly increasing per origin; `hop_count` is the
/// remaining gossip TTL and is the only field a relay rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    #[serde(rename = "node_id")]
    pub origin: NodeId,

    #[serde(rename = "timestamp")]
    pub timestamp_s: f64,

    pub sequence_number: u64,

    pub hop_count: u8,

    pub links: BTreeMap<PairKey, LinkBelief>,

    pub devices: BTreeMap<NodeId, DeviceBelief>,

    pub zones: BTreeMap<String, ZoneBelief>,

    /// Acoustic ranges to peers measured since the last emission, meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acoustic_ranges: Option<BTreeMap<NodeId, f64>>,
}

impl Belief {
    /// Creates an empty belief frame for an origin.
    pub fn empty(origin: NodeId, sequence_number: u64, hop_count: u8, timestamp_s: f64) -> Self {
        Self {
            origin,
            timestamp_s,
            sequence_number,
            hop_count,
            links: BTreeMap::new(),
            devices: BTreeMap::new(),
            zones: BTreeMap::new(),
            acoustic_ranges: None,
        }
    }

    /// True when the belief is older than the staleness horizon.
    pub fn is_stale(&self, now_s: f64, horizon_s: f64) -> bool {
        now_s - self.timestamp_s > horizon_s
    }

    /// Copy with the hop budget spent by one.
    pub fn relayed(&self) -> Option<Self> {
        if self.hop_count == 0 {
            return None;
        }
        let mut copy = self.clone();
        copy.hop_count -= 1;
        Some(copy)
    }
}

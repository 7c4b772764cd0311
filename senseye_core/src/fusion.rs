//! Consensus fusion: inverse-variance averaging of local and peer beliefs.
//!
//! Every contribution's confidence maps to a precision through the shared
//! contract in [`crate::confidence`]. Agreement between independent peers
//! pushes the fused confidence above any single input; disagreement on the
//! actual values attenuates it through a variance penalty. The fold is
//! commutative and associative, so peer arrival order within a fusion
//! window is irrelevant.

use std::collections::BTreeMap;

use senseye_env::NodeId;

use crate::belief::{Belief, PairKey};
use crate::confidence::{self, WeightedMean};
use crate::inference::zone_confidence;

/// Tunables for consensus fusion.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Disagreement penalty scale `s` in `1 / (1 + s * v)`.
    pub disagreement_scale: f64,

    /// Beliefs older than this are excluded, seconds.
    pub stale_horizon_s: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            disagreement_scale: 0.5,
            stale_horizon_s: 10.0,
        }
    }
}

/// Fused view of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedLink {
    pub attenuation_db: f64,
    pub motion_prob: f64,
    pub confidence: f64,
    pub contributors: usize,
}

/// Fused view of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedDevice {
    pub rssi_dbm: f64,
    pub distance_m: f64,
    pub moving: bool,
    pub confidence: f64,
    pub contributors: usize,
}

/// Fused view of one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedZone {
    pub occupied_prob: f64,
    pub motion_prob: f64,
    pub confidence: f64,
}

/// Output of one fusion cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusedWorld {
    pub links: BTreeMap<PairKey, FusedLink>,
    pub devices: BTreeMap<NodeId, FusedDevice>,
    pub zones: BTreeMap<String, FusedZone>,
}

/// The consensus fusion engine.
#[derive(Debug, Clone, Default)]
pub struct ConsensusFusion {
    config: FusionConfig,
}

impl ConsensusFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuses one belief per origin (the caller keeps only the latest per
    /// origin; the sequence guard upstream enforces that). Stale beliefs
    /// drop out here.
    pub fn fuse(&self, beliefs: &[&Belief], now_s: f64) -> FusedWorld {
        let live: Vec<&Belief> = beliefs
            .iter()
            .copied()
            .filter(|b| !b.is_stale(now_s, self.config.stale_horizon_s))
            .collect();

        let mut world = FusedWorld::default();
        self.fuse_links(&live, &mut world);
        self.fuse_devices(&live, &mut world);
        self.fuse_zones(&live, &mut world);
        world
    }

    fn fuse_links(&self, beliefs: &[&Belief], world: &mut FusedWorld) {
        let mut attenuation: BTreeMap<PairKey, WeightedMean> = BTreeMap::new();
        let mut motion: BTreeMap<PairKey, WeightedMean> = BTreeMap::new();

        for belief in beliefs {
            for (pair, link) in &belief.links {
                let pi = confidence::precision(link.confidence);
                attenuation
                    .entry(pair.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(link.attenuation_db, pi);
                motion
                    .entry(pair.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(link.motion_prob, pi);
            }
        }

        for (pair, acc) in attenuation {
            let Some(attenuation_db) = acc.mean() else {
                continue;
            };
            let motion_prob = motion
                .get(&pair)
                .and_then(|m| m.mean())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);

            let c_base = confidence::base_confidence(acc.total_weight());
            let penalty = confidence::disagreement_penalty(
                acc.disagreement(),
                self.config.disagreement_scale,
            );
            world.links.insert(
                pair,
                FusedLink {
                    attenuation_db,
                    motion_prob,
                    confidence: (c_base * penalty).clamp(0.0, confidence::MAX_CONFIDENCE),
                    contributors: acc.count(),
                },
            );
        }
    }

    fn fuse_devices(&self, beliefs: &[&Belief], world: &mut FusedWorld) {
        let mut rssi: BTreeMap<NodeId, WeightedMean> = BTreeMap::new();
        let mut distance: BTreeMap<NodeId, WeightedMean> = BTreeMap::new();
        let mut motion: BTreeMap<NodeId, WeightedMean> = BTreeMap::new();

        for belief in beliefs {
            for (device, d) in &belief.devices {
                let pi = confidence::precision(d.confidence);
                // Far-range RSSI distances are poor; the range-squared
                // down-weight keeps them from dominating the estimate.
                let w_dist = pi / d.estimated_distance_m.max(1.0).powi(2);
                rssi.entry(device.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(d.rssi_dbm, pi);
                distance
                    .entry(device.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(d.estimated_distance_m, w_dist);
                motion
                    .entry(device.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(if d.moving { 1.0 } else { 0.0 }, pi);
            }
        }

        for (device, acc) in rssi {
            let (Some(rssi_dbm), Some(distance_m)) =
                (acc.mean(), distance.get(&device).and_then(|d| d.mean()))
            else {
                continue;
            };
            let moving = motion
                .get(&device)
                .and_then(|m| m.mean())
                .unwrap_or(0.0)
                > 0.5;

            let c_base = confidence::base_confidence(acc.total_weight());
            let penalty = confidence::disagreement_penalty(
                acc.disagreement(),
                self.config.disagreement_scale,
            );
            world.devices.insert(
                device,
                FusedDevice {
                    rssi_dbm,
                    distance_m,
                    moving,
                    confidence: (c_base * penalty).clamp(0.0, confidence::MAX_CONFIDENCE),
                    contributors: acc.count(),
                },
            );
        }
    }

    fn fuse_zones(&self, beliefs: &[&Belief], world: &mut FusedWorld) {
        let mut occupied: BTreeMap<String, WeightedMean> = BTreeMap::new();
        let mut motion: BTreeMap<String, WeightedMean> = BTreeMap::new();

        for belief in beliefs {
            for (zone, z) in &belief.zones {
                let pi = confidence::precision(zone_confidence(z.occupied_prob, z.motion_prob));
                occupied
                    .entry(zone.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(z.occupied_prob, pi);
                motion
                    .entry(zone.clone())
                    .or_insert_with(WeightedMean::new)
                    .add(z.motion_prob, pi);
            }
        }

        for (zone, acc) in occupied {
            let Some(occupied_prob) = acc.mean() else {
                continue;
            };
            let motion_prob = motion
                .get(&zone)
                .and_then(|m| m.mean())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            world.zones.insert(
                zone,
                FusedZone {
                    occupied_prob,
                    motion_prob,
                    confidence: zone_confidence(occupied_prob, motion_prob),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::belief::{DeviceBelief, LinkBelief, ZoneBelief};
    use approx::assert_relative_eq;

    fn link_belief(origin: &str, seq: u64, attenuation: f64, confidence: f64) -> Belief {
        let mut b = Belief::empty(NodeId::new(origin), seq, 3, 100.0);
        b.links.insert(
            PairKey::new(NodeId::new("a"), NodeId::new("b")),
            LinkBelief {
                attenuation_db: attenuation,
                motion_prob: 0.0,
                confidence,
            },
        );
        b
    }

    #[test]
    fn agreement_boosts_confidence() {
        // Three peers agreeing to within 1 dB at c = 0.8 each: the fused
        // confidence must exceed any individual one.
        let beliefs = [
            link_belief("n1", 1, 10.0, 0.8),
            link_belief("n2", 1, 11.0, 0.8),
            link_belief("n3", 1, 10.0, 0.8),
        ];
        let refs: Vec<&Belief> = beliefs.iter().collect();
        let world = ConsensusFusion::default().fuse(&refs, 100.0);

        let fused = &world.links[&PairKey::new(NodeId::new("a"), NodeId::new("b"))];
        assert_relative_eq!(fused.attenuation_db, 31.0 / 3.0, max_relative = 1e-4);
        // c_base = 12/13, penalty = 1/(1 + 0.5 * 2/9).
        let expected = (12.0 / 13.0) / (1.0 + 0.5 * (2.0 / 9.0));
        assert_relative_eq!(fused.confidence, expected, max_relative = 1e-3);
        assert!(fused.confidence > 0.8);
    }

    #[test]
    fn fused_value_is_bounded_and_exact_on_agreement() {
        let beliefs = [
            link_belief("n1", 1, 4.0, 0.3),
            link_belief("n2", 1, 9.0, 0.9),
            link_belief("n3", 1, 6.0, 0.6),
        ];
        let refs: Vec<&Belief> = beliefs.iter().collect();
        let world = ConsensusFusion::default().fuse(&refs, 100.0);
        let fused = &world.links[&PairKey::new(NodeId::new("a"), NodeId::new("b"))];
        assert!(fused.attenuation_db >= 4.0 && fused.attenuation_db <= 9.0);

        let agreeing = [
            link_belief("n1", 1, 7.25, 0.3),
            link_belief("n2", 1, 7.25, 0.9),
        ];
        let refs: Vec<&Belief> = agreeing.iter().collect();
        let world = ConsensusFusion::default().fuse(&refs, 100.0);
        let fused = &world.links[&PairKey::new(NodeId::new("a"), NodeId::new("b"))];
        assert_eq!(fused.attenuation_db, 7.25);
    }

    #[test]
    fn disagreement_attenuates_confidence() {
        let agree = [
            link_belief("n1", 1, 10.0, 0.8),
            link_belief("n2", 1, 10.0, 0.8),
        ];
        let disagree = [
            link_belief("n1", 1, 2.0, 0.8),
            link_belief("n2", 1, 18.0, 0.8),
        ];
        let fuse = |bs: &[Belief]| {
            let refs: Vec<&Belief> = bs.iter().collect();
            ConsensusFusion::default().fuse(&refs, 100.0).links
                [&PairKey::new(NodeId::new("a"), NodeId::new("b"))]
                .confidence
        };
        assert!(fuse(&disagree) < fuse(&agree));
    }

    #[test]
    fn fusion_is_order_independent() {
        let beliefs = [
            link_belief("n1", 1, 3.0, 0.4),
            link_belief("n2", 1, 12.0, 0.7),
            link_belief("n3", 1, 8.0, 0.9),
        ];
        let forward: Vec<&Belief> = beliefs.iter().collect();
        let backward: Vec<&Belief> = beliefs.iter().rev().collect();
        let fusion = ConsensusFusion::default();
        let key = PairKey::new(NodeId::new("a"), NodeId::new("b"));

        let f = fusion.fuse(&forward, 100.0);
        let b = fusion.fuse(&backward, 100.0);
        assert_relative_eq!(
            f.links[&key].attenuation_db,
            b.links[&key].attenuation_db,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            f.links[&key].confidence,
            b.links[&key].confidence,
            max_relative = 1e-12
        );
    }

    #[test]
    fn stale_beliefs_are_excluded() {
        let mut old = link_belief("n1", 1, 10.0, 0.8);
        old.timestamp_s = 50.0;
        let fresh = link_belief("n2", 2, 4.0, 0.8);
        let beliefs = [old, fresh];
        let refs: Vec<&Belief> = beliefs.iter().collect();

        let world = ConsensusFusion::default().fuse(&refs, 100.0);
        let fused = &world.links[&PairKey::new(NodeId::new("a"), NodeId::new("b"))];
        assert_eq!(fused.contributors, 1);
        assert_eq!(fused.attenuation_db, 4.0);
    }

    #[test]
    fn device_distance_downweights_far_ranges() {
        let mut near = Belief::empty(NodeId::new("n1"), 1, 3, 100.0);
        near.devices.insert(
            NodeId::new("phone"),
            DeviceBelief {
                rssi_dbm: -50.0,
                estimated_distance_m: 2.0,
                moving: false,
                confidence: 0.7,
            },
        );
        let mut far = Belief::empty(NodeId::new("n2"), 1, 3, 100.0);
        far.devices.insert(
            NodeId::new("phone"),
            DeviceBelief {
                rssi_dbm: -80.0,
                estimated_distance_m: 30.0,
                moving: false,
                confidence: 0.7,
            },
        );
        let beliefs = [near, far];
        let refs: Vec<&Belief> = beliefs.iter().collect();
        let world = ConsensusFusion::default().fuse(&refs, 100.0);

        let device = &world.devices[&NodeId::new("phone")];
        // Equal confidences, but the near range dominates the distance.
        assert!(device.distance_m < 4.0, "distance {}", device.distance_m);
        // RSSI has no range down-weight, so it lands midway.
        assert_relative_eq!(device.rssi_dbm, -65.0, epsilon = 0.5);
    }

    #[test]
    fn zones_fuse_by_derived_confidence() {
        let mut decisive = Belief::empty(NodeId::new("n1"), 1, 3, 100.0);
        decisive.zones.insert(
            "hall".into(),
            ZoneBelief {
                occupied_prob: 0.95,
                motion_prob: 0.9,
            },
        );
        let mut vague = Belief::empty(NodeId::new("n2"), 1, 3, 100.0);
        vague.zones.insert(
            "hall".into(),
            ZoneBelief {
                occupied_prob: 0.5,
                motion_prob: 0.5,
            },
        );
        let beliefs = [decisive, vague];
        let refs: Vec<&Belief> = beliefs.iter().collect();
        let world = ConsensusFusion::default().fuse(&refs, 100.0);

        let zone = &world.zones["hall"];
        // The decisive contribution carries far more precision.
        assert!(zone.occupied_prob > 0.8, "occupied {}", zone.occupied_prob);
        assert!(zone.motion_prob > 0.75);
    }
}

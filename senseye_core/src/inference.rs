//! Local inference: filtered signal paths to a confidence-tagged Belief.
//!
//! Runs once per pipeline cycle over a snapshot of the filter bank. Targets
//! with a known floorplan position become links; everything else is an
//! observed device. Zone beliefs aggregate over the links crossing each
//! room.

use std::collections::BTreeMap;

use senseye_env::NodeId;

use crate::belief::{Belief, DeviceBelief, LinkBelief, PairKey, ZoneBelief};
use crate::floorplan::FloorPlan;
use crate::kalman::{FilterBank, PathFilter};
use crate::propagation::PathLossModel;

/// Tunables for local inference.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Window-variance threshold above which a path counts as moving, dB².
    pub motion_variance_db2: f64,

    /// Average attenuation mapped to full zone occupancy, dB.
    pub occupancy_full_attenuation_db: f64,

    /// Innovation scale in the confidence discount `1/(1 + |y|/scale)`.
    pub innovation_scale_db: f64,

    /// Matched-filter SNR mapped to zero acoustic confidence.
    pub snr_floor: f64,

    /// Matched-filter SNR mapped to full acoustic confidence.
    pub snr_ceiling: f64,

    /// Hop TTL stamped on emitted beliefs.
    pub hop_budget: u8,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            motion_variance_db2: 4.0,
            occupancy_full_attenuation_db: 20.0,
            innovation_scale_db: 8.0,
            snr_floor: 3.0,
            snr_ceiling: 20.0,
            hop_budget: 3,
        }
    }
}

/// Stateless inference engine (the sequence counter lives in the pipeline).
#[derive(Debug, Clone)]
pub struct LocalInference {
    config: InferenceConfig,
    model: PathLossModel,
}

impl LocalInference {
    pub fn new(config: InferenceConfig) -> Self {
        Self {
            config,
            model: PathLossModel::indoor(),
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// RF confidence: sample-count fill ratio discounted by the innovation.
    pub fn rf_confidence(&self, filter: &PathFilter, window: usize) -> f64 {
        let c_samples = (filter.sample_count() as f64 / window.max(1) as f64).min(1.0);
        let p_innov = 1.0 / (1.0 + filter.innovation().abs() / self.config.innovation_scale_db);
        c_samples * p_innov
    }

    /// Acoustic confidence: sample fill blended with the matched-filter SNR.
    pub fn acoustic_confidence(&self, c_samples: f64, peak_snr: f64) -> f64 {
        let span = (self.config.snr_ceiling - self.config.snr_floor).max(1e-9);
        let c_snr = ((peak_snr - self.config.snr_floor) / span).clamp(0.0, 1.0);
        0.4 * c_samples.clamp(0.0, 1.0) + 0.6 * c_snr
    }

    /// Builds the node's belief for this cycle.
    ///
    /// `acoustic_ranges` carries distances measured since the last emission;
    /// they ride along in the belief for the calibration orchestrator.
    pub fn infer(
        &self,
        bank: &FilterBank,
        floorplan: Option<&FloorPlan>,
        origin: &NodeId,
        sequence_number: u64,
        now_s: f64,
        acoustic_ranges: Option<BTreeMap<NodeId, f64>>,
    ) -> Belief {
        let mut belief = Belief::empty(
            origin.clone(),
            sequence_number,
            self.config.hop_budget,
            now_s,
        );
        let window = bank.config().window;

        for (key, filter) in bank.iter() {
            if key.source != *origin {
                continue;
            }
            let confidence = self.rf_confidence(filter, window);
            let moving = filter.window_variance() > self.config.motion_variance_db2;

            let link_positions = floorplan.and_then(|plan| {
                Some((plan.position_of(&key.source)?, plan.position_of(&key.target)?))
            });

            match link_positions {
                Some((a, b)) => {
                    let distance = nalgebra::distance(&a, &b);
                    let expected = self.model.expected_rssi(distance);
                    let attenuation = (expected - filter.rssi()).max(0.0);
                    let pair = PairKey::new(key.source.clone(), key.target.clone());
                    let motion_prob = if moving { 1.0 } else { 0.0 };
                    // Two kinds (wifi + ble) can observe one pair; keep the
                    // more confident estimate.
                    let keep_existing = belief
                        .links
                        .get(&pair)
                        .is_some_and(|existing| existing.confidence >= confidence);
                    if !keep_existing {
                        belief.links.insert(
                            pair,
                            LinkBelief {
                                attenuation_db: attenuation,
                                motion_prob,
                                confidence,
                            },
                        );
                    }
                }
                None => {
                    let rssi = filter.rssi();
                    let device = DeviceBelief {
                        rssi_dbm: rssi,
                        estimated_distance_m: self.model.distance_from_rssi(rssi),
                        moving,
                        confidence,
                    };
                    let keep_existing = belief
                        .devices
                        .get(&key.target)
                        .is_some_and(|existing| existing.confidence >= confidence);
                    if !keep_existing {
                        belief.devices.insert(key.target.clone(), device);
                    }
                }
            }
        }

        if let Some(plan) = floorplan {
            self.infer_zones(plan, &mut belief);
        }
        belief.acoustic_ranges = acoustic_ranges;
        belief
    }

    /// Zone occupancy and motion from the links crossing each room.
    fn infer_zones(&self, plan: &FloorPlan, belief: &mut Belief) {
        for room in &plan.rooms {
            let mut crossing = 0usize;
            let mut moving = 0usize;
            let mut attenuation_sum = 0.0;

            for (pair, link) in &belief.links {
                let (Some(a), Some(b)) = (plan.position_of(pair.a()), plan.position_of(pair.b()))
                else {
                    continue;
                };
                if !room.crossed_by(&a, &b) {
                    continue;
                }
                crossing += 1;
                if link.motion_prob > 0.5 {
                    moving += 1;
                }
                attenuation_sum += link.attenuation_db;
            }

            if crossing == 0 {
                continue;
            }
            let motion_prob = moving as f64 / crossing as f64;
            let avg_attenuation = attenuation_sum / crossing as f64;
            let occupied_prob =
                (avg_attenuation / self.config.occupancy_full_attenuation_db).min(1.0);
            belief.zones.insert(
                room.id.clone(),
                ZoneBelief {
                    occupied_prob,
                    motion_prob,
                },
            );
        }
    }
}

/// Derived zone confidence from how decisive its probabilities are.
///
/// Probabilities near 0.5 carry almost no information; either extreme is
/// decisive. Shared by zone fusion on every node.
pub fn zone_confidence(occupied_prob: f64, motion_prob: f64) -> f64 {
    let decisiveness = (occupied_prob - 0.5).abs().max((motion_prob - 0.5).abs());
    (0.2 + 0.8 * 2.0 * decisiveness).clamp(0.05, 0.99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floorplan::{GridGeometry, Room, Topology, WallGrid};
    use crate::kalman::KalmanConfig;
    use approx::assert_relative_eq;
    use senseye_env::{Measurement, SignalKind};

    fn feed(bank: &mut FilterBank, source: &str, target: &str, rssi: &[f64]) {
        for (i, value) in rssi.iter().enumerate() {
            bank.ingest(&Measurement {
                source: NodeId::new(source),
                target: NodeId::new(target),
                kind: SignalKind::Wifi,
                timestamp_s: i as f64,
                value: *value,
                snr: None,
            });
        }
    }

    fn plan_with_two_nodes() -> FloorPlan {
        let geometry = GridGeometry {
            origin: [-1.0, -1.0],
            cell_size_m: 1.0,
            cols: 12,
            rows: 6,
        };
        FloorPlan {
            node_positions: BTreeMap::from([
                (NodeId::new("a"), [0.0, 0.0]),
                (NodeId::new("b"), [10.0, 0.0]),
            ]),
            walls: WallGrid::zeros(geometry),
            rooms: vec![Room::rect("room-0", [-0.5, -0.5], [10.5, 2.0])],
            topology: Topology::default(),
            baseline_device_rssis: BTreeMap::new(),
            built_at_s: 0.0,
        }
    }

    #[test]
    fn positioned_targets_become_links() {
        let mut bank = FilterBank::new(KalmanConfig::default());
        feed(&mut bank, "a", "b", &[-80.0; 10]);
        let plan = plan_with_two_nodes();

        let inference = LocalInference::new(InferenceConfig::default());
        let belief = inference.infer(&bank, Some(&plan), &NodeId::new("a"), 1, 10.0, None);

        assert_eq!(belief.links.len(), 1);
        assert!(belief.devices.is_empty());
        let link = &belief.links[&PairKey::new(NodeId::new("a"), NodeId::new("b"))];
        // Expected free path at 10 m indoor is -70 dBm; observed -80 means
        // 10 dB of excess attenuation.
        assert_relative_eq!(link.attenuation_db, 10.0, epsilon = 0.5);
        assert!(link.confidence > 0.3);
    }

    #[test]
    fn unknown_targets_become_devices() {
        let mut bank = FilterBank::new(KalmanConfig::default());
        feed(&mut bank, "a", "phone-7", &[-58.0; 10]);

        let inference = LocalInference::new(InferenceConfig::default());
        let belief = inference.infer(&bank, None, &NodeId::new("a"), 1, 10.0, None);

        assert!(belief.links.is_empty());
        let device = &belief.devices[&NodeId::new("phone-7")];
        assert_relative_eq!(device.rssi_dbm, -58.0, epsilon = 0.5);
        assert!(device.estimated_distance_m > 0.1);
        assert!(!device.moving);
    }

    #[test]
    fn swinging_rssi_marks_motion() {
        let mut bank = FilterBank::new(KalmanConfig::default());
        let swings: Vec<f64> = (0..12)
            .map(|i| if i % 2 == 0 { -50.0 } else { -64.0 })
            .collect();
        feed(&mut bank, "a", "phone-7", &swings);

        let inference = LocalInference::new(InferenceConfig::default());
        let belief = inference.infer(&bank, None, &NodeId::new("a"), 1, 12.0, None);
        assert!(belief.devices[&NodeId::new("phone-7")].moving);
    }

    #[test]
    fn zones_aggregate_crossing_links() {
        let mut bank = FilterBank::new(KalmanConfig::default());
        feed(&mut bank, "a", "b", &[-85.0; 10]);
        let plan = plan_with_two_nodes();

        let inference = LocalInference::new(InferenceConfig::default());
        let belief = inference.infer(&bank, Some(&plan), &NodeId::new("a"), 1, 10.0, None);

        let zone = &belief.zones["room-0"];
        // 15 dB of excess over a 20 dB full scale.
        assert_relative_eq!(zone.occupied_prob, 0.75, epsilon = 0.05);
        assert_eq!(zone.motion_prob, 0.0);
    }

    #[test]
    fn rf_confidence_needs_a_full_window() {
        let mut bank = FilterBank::new(KalmanConfig::default());
        feed(&mut bank, "a", "x", &[-60.0; 2]);
        feed(&mut bank, "a", "y", &[-60.0; 20]);
        let inference = LocalInference::new(InferenceConfig::default());
        let window = bank.config().window;

        let partial = inference.rf_confidence(
            bank.get(&crate::kalman::PathKey {
                source: NodeId::new("a"),
                target: NodeId::new("x"),
                kind: SignalKind::Wifi,
            })
            .unwrap(),
            window,
        );
        let full = inference.rf_confidence(
            bank.get(&crate::kalman::PathKey {
                source: NodeId::new("a"),
                target: NodeId::new("y"),
                kind: SignalKind::Wifi,
            })
            .unwrap(),
            window,
        );
        assert!(partial < 0.2);
        assert!(full > 0.8);
    }

    #[test]
    fn acoustic_confidence_blends_snr() {
        let inference = LocalInference::new(InferenceConfig::default());
        assert_relative_eq!(inference.acoustic_confidence(1.0, 20.0), 1.0);
        assert_relative_eq!(inference.acoustic_confidence(1.0, 3.0), 0.4);
        let mid = inference.acoustic_confidence(0.5, 11.5);
        assert_relative_eq!(mid, 0.4 * 0.5 + 0.6 * 0.5, epsilon = 1e-9);
    }

    #[test]
    fn zone_confidence_rewards_decisiveness() {
        assert_relative_eq!(zone_confidence(0.5, 0.5), 0.2);
        assert_relative_eq!(zone_confidence(1.0, 0.5), 0.99);
        assert!(zone_confidence(0.9, 0.5) > zone_confidence(0.6, 0.5));
    }
}

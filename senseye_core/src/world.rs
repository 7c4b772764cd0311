//! World state: the live overlay on top of the static floorplan.
//!
//! Zone motion intensity decays exponentially between cycles and is floored
//! by the freshly fused motion probability, so a burst of motion lights a
//! zone up immediately and fades smoothly. Devices are pinned to the
//! nearest room center whenever a position estimate exists. A snapshot is
//! published per fusion cycle; failures show up as status fields here, not
//! as crashes.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use senseye_env::NodeId;

use crate::floorplan::FloorPlan;
use crate::fusion::FusedWorld;
use crate::tomography::AttenuationField;

/// World/trigger tunables.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Motion intensity decay rate, 1/s.
    pub motion_decay_lambda: f64,

    /// Mean device-RSSI drift that triggers recalibration, dB.
    pub drift_threshold_db: f64,

    /// Minimum common devices required for a drift verdict.
    pub min_common_devices: usize,

    /// Scheduled acoustic recalibration interval, seconds (None = never).
    pub acoustic_interval_s: Option<f64>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            motion_decay_lambda: 0.5,
            drift_threshold_db: 8.0,
            min_common_devices: 3,
            acoustic_interval_s: None,
        }
    }
}

/// Live activity of one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneActivity {
    /// Exponentially decayed motion level, [0, 1].
    pub motion_intensity: f64,
    pub occupied_prob: f64,
    pub confidence: f64,
}

/// Live estimate of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEstimate {
    pub position: Option<[f64; 2]>,
    /// Room the device is assigned to, when positioned.
    pub room: Option<String>,
    pub distance_m: f64,
    pub moving: bool,
    pub confidence: f64,
}

/// Health of the local node, surfaced to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub peers_alive: usize,
    pub peers_known: usize,
    pub malformed_frames: u64,
    pub oversize_frames: u64,
    pub duplicate_beliefs: u64,
}

/// Calibration status surfaced to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum CalibrationStatus {
    /// No floorplan yet.
    #[default]
    None,
    /// A floorplan exists and no trigger has fired.
    Current,
    /// A trigger fired; recalibration is recommended.
    Due { reason: String },
    /// The last attempt failed.
    Failed { error: String },
}

/// Why recalibration fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecalibrationTrigger {
    NoFloorplan,
    PeerSetChanged,
    ScheduledAcoustic,
    RssiDrift,
}

impl std::fmt::Display for RecalibrationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoFloorplan => "no floorplan",
            Self::PeerSetChanged => "peer set changed",
            Self::ScheduledAcoustic => "scheduled acoustic interval elapsed",
            Self::RssiDrift => "device RSSI drift from baseline",
        };
        f.write_str(s)
    }
}

/// Immutable per-cycle copy exposed to renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub node: NodeId,
    pub timestamp_s: f64,
    /// Seconds since the floorplan was built, when one exists.
    pub map_age_s: Option<f64>,
    pub node_positions: BTreeMap<NodeId, [f64; 2]>,
    pub zones: BTreeMap<String, ZoneActivity>,
    pub devices: BTreeMap<NodeId, DeviceEstimate>,
    /// Live tomography overlay from the latest cycle, when one was solved.
    pub live_attenuation: Option<AttenuationField>,
    pub node_health: NodeHealth,
    pub calibration_status: CalibrationStatus,
}

/// The mutable world owned by the pipeline task.
#[derive(Debug)]
pub struct WorldState {
    config: WorldConfig,
    floorplan: Option<FloorPlan>,
    zones: BTreeMap<String, ZoneActivity>,
    devices: BTreeMap<NodeId, DeviceEstimate>,
    live_attenuation: Option<AttenuationField>,
    last_update_s: Option<f64>,
}

impl WorldState {
    pub fn new(config: WorldConfig, floorplan: Option<FloorPlan>) -> Self {
        Self {
            config,
            floorplan,
            zones: BTreeMap::new(),
            devices: BTreeMap::new(),
            live_attenuation: None,
            last_update_s: None,
        }
    }

    pub fn floorplan(&self) -> Option<&FloorPlan> {
        self.floorplan.as_ref()
    }

    pub fn set_floorplan(&mut self, plan: FloorPlan) {
        self.floorplan = Some(plan);
        self.zones.clear();
    }

    /// Folds one fusion cycle into the live overlay. `device_positions`
    /// carries the trilateration fixes that converged this cycle.
    pub fn apply_cycle(
        &mut self,
        fused: &FusedWorld,
        device_positions: &BTreeMap<NodeId, Point2<f64>>,
        live_attenuation: Option<AttenuationField>,
        now_s: f64,
    ) {
        self.live_attenuation = live_attenuation;
        let dt = self
            .last_update_s
            .map(|last| (now_s - last).max(0.0))
            .unwrap_or(0.0);
        self.last_update_s = Some(now_s);

        // Decay every known zone, then floor with the fresh fusion.
        let decay = (-self.config.motion_decay_lambda * dt).exp();
        for activity in self.zones.values_mut() {
            activity.motion_intensity *= decay;
        }
        for (zone, fused_zone) in &fused.zones {
            let entry = self.zones.entry(zone.clone()).or_insert(ZoneActivity {
                motion_intensity: 0.0,
                occupied_prob: 0.0,
                confidence: 0.0,
            });
            entry.motion_intensity = entry.motion_intensity.max(fused_zone.motion_prob);
            entry.occupied_prob = fused_zone.occupied_prob;
            entry.confidence = fused_zone.confidence;
        }

        self.devices.clear();
        for (device, fused_device) in &fused.devices {
            let position = device_positions.get(device);
            let room = position.and_then(|p| {
                self.floorplan
                    .as_ref()
                    .and_then(|plan| plan.nearest_room(p))
                    .map(|room| room.id.clone())
            });
            self.devices.insert(
                device.clone(),
                DeviceEstimate {
                    position: position.map(|p| [p.x, p.y]),
                    room,
                    distance_m: fused_device.distance_m,
                    moving: fused_device.moving,
                    confidence: fused_device.confidence,
                },
            );
        }
    }

    /// Evaluates the recalibration policy; any one trigger is enough.
    pub fn recalibration_trigger(
        &self,
        peer_set_changed: bool,
        last_acoustic_s: Option<f64>,
        current_device_rssis: &BTreeMap<NodeId, f64>,
        now_s: f64,
    ) -> Option<RecalibrationTrigger> {
        let Some(plan) = &self.floorplan else {
            return Some(RecalibrationTrigger::NoFloorplan);
        };
        if peer_set_changed {
            return Some(RecalibrationTrigger::PeerSetChanged);
        }
        if let Some(interval) = self.config.acoustic_interval_s {
            let since = now_s - last_acoustic_s.unwrap_or(plan.built_at_s);
            if since >= interval {
                return Some(RecalibrationTrigger::ScheduledAcoustic);
            }
        }

        let drifts: Vec<f64> = plan
            .baseline_device_rssis
            .iter()
            .filter_map(|(device, baseline)| {
                current_device_rssis
                    .get(device)
                    .map(|current| (current - baseline).abs())
            })
            .collect();
        if drifts.len() >= self.config.min_common_devices {
            let mean = drifts.iter().sum::<f64>() / drifts.len() as f64;
            if mean > self.config.drift_threshold_db {
                return Some(RecalibrationTrigger::RssiDrift);
            }
        }
        None
    }

    /// Publishes the immutable per-cycle snapshot.
    pub fn snapshot(
        &self,
        node: &NodeId,
        now_s: f64,
        node_health: NodeHealth,
        calibration_status: CalibrationStatus,
    ) -> WorldSnapshot {
        WorldSnapshot {
            node: node.clone(),
            timestamp_s: now_s,
            map_age_s: self.floorplan.as_ref().map(|plan| plan.age_s(now_s)),
            node_positions: self
                .floorplan
                .as_ref()
                .map(|plan| plan.node_positions.clone())
                .unwrap_or_default(),
            zones: self.zones.clone(),
            devices: self.devices.clone(),
            live_attenuation: self.live_attenuation.clone(),
            node_health,
            calibration_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floorplan::{GridGeometry, Room, Topology, WallGrid};
    use crate::fusion::{FusedDevice, FusedZone};
    use approx::assert_relative_eq;

    fn plan() -> FloorPlan {
        let geometry = GridGeometry {
            origin: [0.0, 0.0],
            cell_size_m: 1.0,
            cols: 10,
            rows: 10,
        };
        FloorPlan {
            node_positions: BTreeMap::from([(NodeId::new("a"), [0.0, 0.0])]),
            walls: WallGrid::zeros(geometry),
            rooms: vec![
                Room::rect("east", [5.0, 0.0], [10.0, 10.0]),
                Room::rect("west", [0.0, 0.0], [5.0, 10.0]),
            ],
            topology: Topology::default(),
            baseline_device_rssis: BTreeMap::from([
                (NodeId::new("p1"), -50.0),
                (NodeId::new("p2"), -60.0),
                (NodeId::new("p3"), -70.0),
            ]),
            built_at_s: 0.0,
        }
    }

    fn fused_with_zone(motion: f64) -> FusedWorld {
        let mut fused = FusedWorld::default();
        fused.zones.insert(
            "west".into(),
            FusedZone {
                occupied_prob: 0.6,
                motion_prob: motion,
                confidence: 0.5,
            },
        );
        fused
    }

    #[test]
    fn motion_intensity_decays_and_refloors() {
        let mut world = WorldState::new(WorldConfig::default(), Some(plan()));

        world.apply_cycle(&fused_with_zone(0.9), &BTreeMap::new(), None, 0.0);
        assert_relative_eq!(world.zones["west"].motion_intensity, 0.9);

        // Motion stops; intensity decays with exp(-lambda * dt).
        world.apply_cycle(&fused_with_zone(0.0), &BTreeMap::new(), None, 2.0);
        let expected = 0.9 * (-0.5f64 * 2.0).exp();
        assert_relative_eq!(
            world.zones["west"].motion_intensity,
            expected,
            max_relative = 1e-9
        );

        // New motion floors it back up immediately.
        world.apply_cycle(&fused_with_zone(0.8), &BTreeMap::new(), None, 3.0);
        assert_relative_eq!(world.zones["west"].motion_intensity, 0.8);
    }

    #[test]
    fn devices_are_assigned_to_nearest_room() {
        let mut world = WorldState::new(WorldConfig::default(), Some(plan()));
        let mut fused = FusedWorld::default();
        fused.devices.insert(
            NodeId::new("phone"),
            FusedDevice {
                rssi_dbm: -55.0,
                distance_m: 3.0,
                moving: false,
                confidence: 0.7,
                contributors: 2,
            },
        );
        let positions = BTreeMap::from([(NodeId::new("phone"), Point2::new(8.0, 5.0))]);
        world.apply_cycle(&fused, &positions, None, 1.0);

        let device = &world.devices[&NodeId::new("phone")];
        assert_eq!(device.room.as_deref(), Some("east"));
        assert_eq!(device.position, Some([8.0, 5.0]));
    }

    #[test]
    fn trigger_priority_no_floorplan_first() {
        let world = WorldState::new(WorldConfig::default(), None);
        assert_eq!(
            world.recalibration_trigger(true, None, &BTreeMap::new(), 10.0),
            Some(RecalibrationTrigger::NoFloorplan)
        );
    }

    #[test]
    fn peer_change_triggers() {
        let world = WorldState::new(WorldConfig::default(), Some(plan()));
        assert_eq!(
            world.recalibration_trigger(true, None, &BTreeMap::new(), 10.0),
            Some(RecalibrationTrigger::PeerSetChanged)
        );
        assert_eq!(
            world.recalibration_trigger(false, None, &BTreeMap::new(), 10.0),
            None
        );
    }

    #[test]
    fn scheduled_acoustic_triggers_after_interval() {
        let config = WorldConfig {
            acoustic_interval_s: Some(600.0),
            ..WorldConfig::default()
        };
        let world = WorldState::new(config, Some(plan()));
        assert_eq!(
            world.recalibration_trigger(false, Some(0.0), &BTreeMap::new(), 599.0),
            None
        );
        assert_eq!(
            world.recalibration_trigger(false, Some(0.0), &BTreeMap::new(), 601.0),
            Some(RecalibrationTrigger::ScheduledAcoustic)
        );
    }

    #[test]
    fn rssi_drift_needs_enough_common_devices() {
        let world = WorldState::new(WorldConfig::default(), Some(plan()));

        // Two drifted devices are below the min-common threshold.
        let two = BTreeMap::from([(NodeId::new("p1"), -70.0), (NodeId::new("p2"), -80.0)]);
        assert_eq!(world.recalibration_trigger(false, None, &two, 10.0), None);

        // Three drifted devices exceed the mean threshold.
        let three = BTreeMap::from([
            (NodeId::new("p1"), -70.0),
            (NodeId::new("p2"), -80.0),
            (NodeId::new("p3"), -85.0),
        ]);
        assert_eq!(
            world.recalibration_trigger(false, None, &three, 10.0),
            Some(RecalibrationTrigger::RssiDrift)
        );

        // Three steady devices do not.
        let steady = BTreeMap::from([
            (NodeId::new("p1"), -51.0),
            (NodeId::new("p2"), -59.0),
            (NodeId::new("p3"), -71.0),
        ]);
        assert_eq!(world.recalibration_trigger(false, None, &steady, 10.0), None);
    }

    #[test]
    fn snapshot_carries_status_fields() {
        let world = WorldState::new(WorldConfig::default(), Some(plan()));
        let snapshot = world.snapshot(
            &NodeId::new("a"),
            42.0,
            NodeHealth {
                peers_alive: 2,
                peers_known: 3,
                ..NodeHealth::default()
            },
            CalibrationStatus::Current,
        );
        assert_eq!(snapshot.map_age_s, Some(42.0));
        assert_eq!(snapshot.node_health.peers_alive, 2);
        assert_eq!(snapshot.calibration_status, CalibrationStatus::Current);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: WorldSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, back);
    }
}

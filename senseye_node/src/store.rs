//! Floorplan persistence: JSON at a well-known path.
//!
//! The wall grid is a dense float array, so it rides as base64-encoded
//! little-endian f32 bytes beside its dimensions rather than as a JSON
//! array of numbers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use senseye_core::{FloorPlan, GridGeometry, Room, Topology, WallGrid};
use senseye_env::NodeId;

use crate::error::NodeError;

/// Persistence seam for the static floorplan.
pub trait FloorPlanStore: Send + Sync {
    fn load(&self) -> Result<Option<FloorPlan>, NodeError>;
    fn save(&self, plan: &FloorPlan) -> Result<(), NodeError>;
}

/// On-disk JSON shape. The in-memory wall grid is flattened to base64.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedFloorPlan {
    node_positions: BTreeMap<NodeId, [f64; 2]>,
    wall_origin: [f64; 2],
    wall_cell_size_m: f64,
    wall_cols: usize,
    wall_rows: usize,
    wall_cells_b64: String,
    rooms: Vec<Room>,
    topology: Topology,
    baseline_device_rssis: BTreeMap<NodeId, f64>,
    built_at_s: f64,
}

impl PersistedFloorPlan {
    fn from_plan(plan: &FloorPlan) -> Self {
        let mut bytes = Vec::with_capacity(plan.walls.cells.len() * 4);
        for value in &plan.walls.cells {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            node_positions: plan.node_positions.clone(),
            wall_origin: plan.walls.geometry.origin,
            wall_cell_size_m: plan.walls.geometry.cell_size_m,
            wall_cols: plan.walls.geometry.cols,
            wall_rows: plan.walls.geometry.rows,
            wall_cells_b64: BASE64.encode(&bytes),
            rooms: plan.rooms.clone(),
            topology: plan.topology.clone(),
            baseline_device_rssis: plan.baseline_device_rssis.clone(),
            built_at_s: plan.built_at_s,
        }
    }

    fn into_plan(self) -> Result<FloorPlan, NodeError> {
        let bytes = BASE64
            .decode(&self.wall_cells_b64)
            .map_err(|e| NodeError::CorruptFloorPlan(format!("wall grid base64: {e}")))?;
        let expected = self.wall_cols * self.wall_rows * 4;
        if bytes.len() != expected {
            return Err(NodeError::CorruptFloorPlan(format!(
                "wall grid is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let cells: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(FloorPlan {
            node_positions: self.node_positions,
            walls: WallGrid {
                geometry: GridGeometry {
                    origin: self.wall_origin,
                    cell_size_m: self.wall_cell_size_m,
                    cols: self.wall_cols,
                    rows: self.wall_rows,
                },
                cells,
            },
            rooms: self.rooms,
            topology: self.topology,
            baseline_device_rssis: self.baseline_device_rssis,
            built_at_s: self.built_at_s,
        })
    }
}

/// JSON file store at `~/.senseye/floorplan.json` by default.
pub struct JsonFloorPlanStore {
    path: PathBuf,
}

impl JsonFloorPlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The well-known per-user location.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".senseye")
            .join("floorplan.json")
    }

    pub fn at_default_path() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FloorPlanStore for JsonFloorPlanStore {
    fn load(&self) -> Result<Option<FloorPlan>, NodeError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedFloorPlan = serde_json::from_str(&contents)?;
        persisted.into_plan().map(Some)
    }

    fn save(&self, plan: &FloorPlan) -> Result<(), NodeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedFloorPlan::from_plan(plan);
        let json = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> FloorPlan {
        let geometry = GridGeometry {
            origin: [-2.0, -2.0],
            cell_size_m: 1.0,
            cols: 8,
            rows: 6,
        };
        let mut walls = WallGrid::zeros(geometry);
        walls.set(2, 3, 7.5);
        walls.set(0, 0, 1.25);

        FloorPlan {
            node_positions: BTreeMap::from([
                (NodeId::new("a"), [0.0, 0.0]),
                (NodeId::new("b"), [3.0, 0.0]),
            ]),
            walls,
            rooms: vec![Room::rect("room-0", [-2.0, -2.0], [6.0, 4.0])],
            topology: Topology {
                rooms: vec!["room-0".into()],
                doorways: vec![],
            },
            baseline_device_rssis: BTreeMap::from([(NodeId::new("phone"), -61.0)]),
            built_at_s: 1234.5,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFloorPlanStore::new(dir.path().join("floorplan.json"));

        assert!(store.load().unwrap().is_none());

        let plan = sample_plan();
        store.save(&plan).unwrap();
        let loaded = store.load().unwrap().expect("plan saved");
        assert_eq!(loaded, plan);
    }

    #[test]
    fn wall_grid_rides_as_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floorplan.json");
        let store = JsonFloorPlanStore::new(&path);
        store.save(&sample_plan()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["wall_cells_b64"].is_string());
        assert_eq!(raw["wall_cols"], 8);
        assert_eq!(raw["wall_rows"], 6);
    }

    #[test]
    fn truncated_grid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floorplan.json");
        let store = JsonFloorPlanStore::new(&path);
        store.save(&sample_plan()).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["wall_cells_b64"] = serde_json::Value::String(BASE64.encode([0u8; 8]));
        std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        assert!(matches!(
            store.load(),
            Err(NodeError::CorruptFloorPlan(_))
        ));
    }
}

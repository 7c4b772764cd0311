//! Static floorplan model: node positions, wall grid, rooms, topology.
//!
//! Produced by the calibration orchestrator, consumed read-only at runtime
//! by tomography's cell projection, zone inference, and the renderer.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use senseye_env::NodeId;

/// Rectangular cell lattice shared by the wall grid and tomography.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// World coordinates of the lower-left corner of cell (0, 0).
    pub origin: [f64; 2],
    /// Cell edge length, meters.
    pub cell_size_m: f64,
    /// Cells along x.
    pub cols: usize,
    /// Cells along y.
    pub rows: usize,
}

impl GridGeometry {
    /// Builds a grid covering the bounding box of `points` with `margin_m`
    /// of slack on every side.
    pub fn covering(points: &[Point2<f64>], cell_size_m: f64, margin_m: f64) -> Self {
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        if points.is_empty() {
            (min_x, min_y, max_x, max_y) = (0.0, 0.0, 1.0, 1.0);
        }
        let origin = [min_x - margin_m, min_y - margin_m];
        let cols = (((max_x - min_x) + 2.0 * margin_m) / cell_size_m).ceil().max(1.0) as usize;
        let rows = (((max_y - min_y) + 2.0 * margin_m) / cell_size_m).ceil().max(1.0) as usize;
        Self {
            origin,
            cell_size_m,
            cols,
            rows,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Flat index of cell (row, col).
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// World coordinates of a cell center.
    pub fn cell_center(&self, row: usize, col: usize) -> Point2<f64> {
        Point2::new(
            self.origin[0] + (col as f64 + 0.5) * self.cell_size_m,
            self.origin[1] + (row as f64 + 0.5) * self.cell_size_m,
        )
    }

    /// Cell containing a world point, if inside the grid.
    pub fn cell_of(&self, p: &Point2<f64>) -> Option<(usize, usize)> {
        let cx = (p.x - self.origin[0]) / self.cell_size_m;
        let cy = (p.y - self.origin[1]) / self.cell_size_m;
        if cx < 0.0 || cy < 0.0 {
            return None;
        }
        let (col, row) = (cx as usize, cy as usize);
        (row < self.rows && col < self.cols).then_some((row, col))
    }
}

/// Per-cell attenuation field over a [`GridGeometry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallGrid {
    pub geometry: GridGeometry,
    /// Attenuation per cell in dB, row-major.
    pub cells: Vec<f32>,
}

impl WallGrid {
    pub fn zeros(geometry: GridGeometry) -> Self {
        let cells = vec![0.0; geometry.cell_count()];
        Self { geometry, cells }
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.cells[self.geometry.index(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        let idx = self.geometry.index(row, col);
        self.cells[idx] = value;
    }

    /// Accumulates attenuation into a cell, keeping the maximum seen.
    pub fn deposit(&mut self, row: usize, col: usize, value: f32) {
        let idx = self.geometry.index(row, col);
        self.cells[idx] = self.cells[idx].max(value);
    }

    /// True when the cell reads as a wall at the given threshold.
    pub fn is_wall(&self, row: usize, col: usize, threshold_db: f32) -> bool {
        self.get(row, col) >= threshold_db
    }
}

/// A room polygon in world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    /// Counter-clockwise vertex list; implicitly closed.
    pub polygon: Vec<[f64; 2]>,
}

impl Room {
    /// Axis-aligned rectangular room.
    pub fn rect(id: impl Into<String>, min: [f64; 2], max: [f64; 2]) -> Self {
        Self {
            id: id.into(),
            polygon: vec![min, [max[0], min[1]], max, [min[0], max[1]]],
        }
    }

    /// Polygon centroid (vertex average is close enough for room centers).
    pub fn center(&self) -> Point2<f64> {
        let n = self.polygon.len().max(1) as f64;
        let (sx, sy) = self
            .polygon
            .iter()
            .fold((0.0, 0.0), |(sx, sy), v| (sx + v[0], sy + v[1]));
        Point2::new(sx / n, sy / n)
    }

    /// Ray-cast point-in-polygon test.
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        let poly = &self.polygon;
        let mut inside = false;
        let n = poly.len();
        if n < 3 {
            return false;
        }
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (poly[i][0], poly[i][1]);
            let (xj, yj) = (poly[j][0], poly[j][1]);
            if (yi > p.y) != (yj > p.y) {
                let x_cross = (xj - xi) * (p.y - yi) / (yj - yi) + xi;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// True when the segment `a -> b` crosses this room: either endpoint
    /// inside, or an edge intersection.
    pub fn crossed_by(&self, a: &Point2<f64>, b: &Point2<f64>) -> bool {
        if self.contains(a) || self.contains(b) {
            return true;
        }
        let n = self.polygon.len();
        if n < 2 {
            return false;
        }
        for i in 0..n {
            let p = self.polygon[i];
            let q = self.polygon[(i + 1) % n];
            if segments_intersect(
                a,
                b,
                &Point2::new(p[0], p[1]),
                &Point2::new(q[0], q[1]),
            ) {
                return true;
            }
        }
        false
    }
}

/// Room-adjacency graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub rooms: Vec<String>,
    /// Pairs of room ids connected by a doorway or opening.
    pub doorways: Vec<(String, String)>,
}

/// The static map shared by every node after calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorPlan {
    pub node_positions: BTreeMap<NodeId, [f64; 2]>,
    pub walls: WallGrid,
    pub rooms: Vec<Room>,
    pub topology: Topology,
    /// Device RSSI snapshot at calibration time, for drift detection.
    pub baseline_device_rssis: BTreeMap<NodeId, f64>,
    /// Wall-clock build time, seconds since the Unix epoch.
    pub built_at_s: f64,
}

impl FloorPlan {
    pub fn position_of(&self, node: &NodeId) -> Option<Point2<f64>> {
        self.node_positions
            .get(node)
            .map(|p| Point2::new(p[0], p[1]))
    }

    /// Age of the map in seconds.
    pub fn age_s(&self, now_s: f64) -> f64 {
        (now_s - self.built_at_s).max(0.0)
    }

    /// The room whose center is nearest to a point.
    pub fn nearest_room(&self, p: &Point2<f64>) -> Option<&Room> {
        self.rooms.iter().min_by(|r1, r2| {
            let d1 = nalgebra::distance_squared(&r1.center(), p);
            let d2 = nalgebra::distance_squared(&r2.center(), p);
            d1.partial_cmp(&d2).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

/// Proper segment intersection test via orientation signs, including
/// collinear-overlap cases.
pub fn segments_intersect(
    a: &Point2<f64>,
    b: &Point2<f64>,
    c: &Point2<f64>,
    d: &Point2<f64>,
) -> bool {
    fn orient(p: &Point2<f64>, q: &Point2<f64>, r: &Point2<f64>) -> f64 {
        (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x)
    }
    fn on_segment(p: &Point2<f64>, q: &Point2<f64>, r: &Point2<f64>) -> bool {
        r.x >= p.x.min(q.x) && r.x <= p.x.max(q.x) && r.y >= p.y.min(q.y) && r.y <= p.y.max(q.y)
    }

    let o1 = orient(a, b, c);
    let o2 = orient(a, b, d);
    let o3 = orient(c, d, a);
    let o4 = orient(c, d, b);

    if (o1 > 0.0) != (o2 > 0.0) && (o3 > 0.0) != (o4 > 0.0) && o1 != 0.0 && o2 != 0.0 && o3 != 0.0 && o4 != 0.0 {
        return true;
    }
    (o1 == 0.0 && on_segment(a, b, c))
        || (o2 == 0.0 && on_segment(a, b, d))
        || (o3 == 0.0 && on_segment(c, d, a))
        || (o4 == 0.0 && on_segment(c, d, b))
}

/// Shortest distance from point `p` to segment `a -> b`.
pub fn point_to_segment_distance(p: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 < 1e-12 {
        return nalgebra::distance(p, a);
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    let proj = a + ab * t;
    nalgebra::distance(p, &proj)
}

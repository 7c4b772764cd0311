//! Calibration orchestrator: ranging fusion, MDS layout, map construction.
//!
//! Turns pairwise distance estimates into a floorplan. Acoustic ranges are
//! preferred wherever they exist; gaps are bridged by bounded-hop paths
//! over the acoustic graph, then by RF ranging, then by a uniform-angular
//! prior against the reference node. Classical MDS recovers a 2D layout,
//! anchors pin the coordinate frame, and wall detection (free-space model,
//! so obstructions show as excess attenuation) plus tomography peaks paint
//! the wall grid. Rooms fall out as connectivity partitions of the walled
//! grid.

use nalgebra::{DMatrix, Point2, Rotation2, Vector2};
use std::collections::BTreeMap;
use thiserror::Error;

use senseye_env::NodeId;

use crate::belief::PairKey;
use crate::floorplan::{FloorPlan, GridGeometry, Room, Topology, WallGrid};
use crate::propagation::PathLossModel;
use crate::tomography::{self, LinkSample, TomographyConfig};

/// One link observation used for wall detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkObservation {
    /// Filtered RSSI over the link, dBm.
    pub rssi_dbm: f64,
    /// Confidence of the estimate, (0, 1).
    pub confidence: f64,
}

/// Everything the orchestrator needs, gathered by the runtime.
#[derive(Debug, Clone, Default)]
pub struct CalibrationInputs {
    /// Participating nodes, reference node first.
    pub nodes: Vec<NodeId>,
    /// Direct acoustic ranges, meters.
    pub acoustic_pairs: BTreeMap<PairKey, f64>,
    /// RF-derived ranges, meters.
    pub rf_pairs: BTreeMap<PairKey, f64>,
    /// Operator-designated anchors; defaults to the first one or two nodes.
    pub anchors: Vec<NodeId>,
    /// Link observations for wall detection.
    pub links: BTreeMap<PairKey, LinkObservation>,
    /// Device RSSI snapshot stored as the drift baseline.
    pub baseline_device_rssis: BTreeMap<NodeId, f64>,
    /// Wall-clock build time, seconds since the Unix epoch.
    pub built_at_s: f64,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Hop cap for acoustic shortest-path completion.
    pub hop_cap: usize,

    /// Wall grid cell size, meters.
    pub cell_size_m: f64,

    /// Grid margin beyond the node bounding box, meters.
    pub grid_margin_m: f64,

    /// Excess attenuation above which a link paints a wall candidate, dB.
    pub wall_attenuation_threshold_db: f64,

    /// Rooms smaller than this many cells are discarded as slivers.
    pub min_room_cells: usize,

    pub tomography: TomographyConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            hop_cap: 3,
            cell_size_m: 1.0,
            grid_margin_m: 2.0,
            wall_attenuation_threshold_db: 6.0,
            min_room_cells: 4,
            tomography: TomographyConfig::default(),
        }
    }
}

/// Calibration failure modes. The node keeps its prior floorplan (or none)
/// when any of these surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("need at least 3 nodes to lay out a floorplan, got {available}")]
    InsufficientNodes { available: usize },

    #[error("designated anchor is not a participating node")]
    InsufficientAnchors,

    #[error("no distance estimate for pair {0}")]
    IncompleteRanging(PairKey),

    #[error("acoustic exchange failed: {0}")]
    AcousticFailure(String),
}

// ============================================================================
// DISTANCE MATRIX FUSION
// ============================================================================

/// Fuses acoustic and RF pairwise ranges into a complete symmetric matrix.
///
/// Preference order per pair: direct acoustic, bounded-hop acoustic path,
/// direct RF, uniform-angular prior from the reference node
/// (`sqrt(d0i² + d0j²)`).
pub fn fuse_distance_matrix(
    nodes: &[NodeId],
    acoustic: &BTreeMap<PairKey, f64>,
    rf: &BTreeMap<PairKey, f64>,
    hop_cap: usize,
) -> Result<DMatrix<f64>, CalibrationError> {
    let n = nodes.len();
    let mut d = DMatrix::zeros(n, n);
    let lookup = |map: &BTreeMap<PairKey, f64>, i: usize, j: usize| {
        map.get(&PairKey::new(nodes[i].clone(), nodes[j].clone()))
            .copied()
    };

    for i in 0..n {
        for j in (i + 1)..n {
            let distance = lookup(acoustic, i, j)
                .or_else(|| acoustic_path_distance(nodes, acoustic, i, j, hop_cap))
                .or_else(|| lookup(rf, i, j));
            if let Some(distance) = distance {
                d[(i, j)] = distance;
                d[(j, i)] = distance;
            }
        }
    }

    // Angular prior: with both reference distances known, assume a right
    // angle at the reference node.
    for i in 1..n {
        for j in (i + 1)..n {
            if d[(i, j)] == 0.0 && d[(0, i)] > 0.0 && d[(0, j)] > 0.0 {
                let prior = (d[(0, i)].powi(2) + d[(0, j)].powi(2)).sqrt();
                d[(i, j)] = prior;
                d[(j, i)] = prior;
            }
        }
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if d[(i, j)] == 0.0 {
                return Err(CalibrationError::IncompleteRanging(PairKey::new(
                    nodes[i].clone(),
                    nodes[j].clone(),
                )));
            }
        }
    }
    Ok(d)
}

/// Shortest path over direct acoustic edges with at most `hop_cap` hops.
fn acoustic_path_distance(
    nodes: &[NodeId],
    acoustic: &BTreeMap<PairKey, f64>,
    from: usize,
    to: usize,
    hop_cap: usize,
) -> Option<f64> {
    let n = nodes.len();
    let edge = |i: usize, j: usize| {
        acoustic
            .get(&PairKey::new(nodes[i].clone(), nodes[j].clone()))
            .copied()
    };

    // dist[k] = best path length to node k using at most h hops.
    let mut dist = vec![f64::INFINITY; n];
    dist[from] = 0.0;
    for _ in 0..hop_cap {
        let mut next = dist.clone();
        for i in 0..n {
            if !dist[i].is_finite() {
                continue;
            }
            for j in 0..n {
                if i == j {
                    continue;
                }
                if let Some(w) = edge(i, j) {
                    let candidate = dist[i] + w;
                    if candidate < next[j] {
                        next[j] = candidate;
                    }
                }
            }
        }
        dist = next;
    }
    dist[to].is_finite().then_some(dist[to])
}

// ============================================================================
// MDS LAYOUT
// ============================================================================

/// Classical multidimensional scaling to 2D.
///
/// Double-centers the squared distances, takes the top-2 eigenpairs of the
/// Gram matrix (negative eigenvalues from noisy input clip to zero), and
/// scales the eigenvectors to coordinates.
pub fn mds_2d(d: &DMatrix<f64>) -> Vec<Point2<f64>> {
    let n = d.nrows();
    if n == 0 {
        return Vec::new();
    }
    let d2 = d.map(|v| v * v);
    let j = DMatrix::identity(n, n) - DMatrix::from_element(n, n, 1.0 / n as f64);
    let b = (&j * d2 * &j) * -0.5;

    let eigen = nalgebra::SymmetricEigen::new(b);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut points = vec![Point2::new(0.0, 0.0); n];
    for (axis, &idx) in order.iter().take(2).enumerate() {
        let scale = eigen.eigenvalues[idx].max(0.0).sqrt();
        for i in 0..n {
            points[i][axis] = eigen.eigenvectors[(i, idx)] * scale;
        }
    }
    points
}

/// Pins the MDS layout to a canonical frame: the first anchor moves to the
/// origin; with a second anchor the layout rotates so it lies on the +x
/// axis and reflects so the first off-axis node has positive y.
pub fn canonicalize_layout(points: &mut [Point2<f64>], anchor: usize, second: Option<usize>) {
    if points.is_empty() || anchor >= points.len() {
        return;
    }
    let offset = points[anchor].coords;
    for p in points.iter_mut() {
        p.coords -= offset;
    }

    let Some(second) = second.filter(|&s| s < points.len() && s != anchor) else {
        return;
    };
    let direction = points[second].coords;
    if direction.norm() > 1e-9 {
        let rotation = Rotation2::rotation_between(&direction, &Vector2::x());
        for p in points.iter_mut() {
            p.coords = rotation * p.coords;
        }
    }

    let flip = points
        .iter()
        .enumerate()
        .filter(|(i, p)| *i != anchor && *i != second && p.y.abs() > 1e-9)
        .map(|(_, p)| p.y < 0.0)
        .next()
        .unwrap_or(false);
    if flip {
        for p in points.iter_mut() {
            p.y = -p.y;
        }
    }
}

// ============================================================================
// WALL AND ROOM DETECTION
// ============================================================================

/// Paints wall candidates into a fresh grid: per-link midpoint segments
/// plus tomography peaks.
fn detect_walls(
    positions: &BTreeMap<NodeId, Point2<f64>>,
    links: &BTreeMap<PairKey, LinkObservation>,
    geometry: GridGeometry,
    config: &CalibrationConfig,
) -> WallGrid {
    let mut walls = WallGrid::zeros(geometry.clone());
    let model = PathLossModel::free_space();
    let mut samples = Vec::new();

    for (pair, observation) in links {
        let (Some(a), Some(b)) = (positions.get(pair.a()), positions.get(pair.b())) else {
            continue;
        };
        let distance = nalgebra::distance(a, b);
        let excess = (model.expected_rssi(distance) - observation.rssi_dbm).max(0.0);
        if excess > 0.0 {
            samples.push(LinkSample {
                a: *a,
                b: *b,
                excess_attenuation_db: excess,
                confidence: observation.confidence,
            });
        }
        if excess < config.wall_attenuation_threshold_db {
            continue;
        }

        // Midpoint-perpendicular candidate: an obstruction on the direct
        // path most plausibly sits across it.
        let mid = nalgebra::center(a, b);
        let along = (b - a).normalize();
        let perpendicular = Vector2::new(-along.y, along.x);
        let half_span = geometry.cell_size_m;
        let steps = 5;
        for s in 0..=steps {
            let t = -half_span + 2.0 * half_span * s as f64 / steps as f64;
            let p = mid + perpendicular * t;
            if let Some((row, col)) = geometry.cell_of(&p) {
                walls.deposit(row, col, excess as f32);
            }
        }
    }

    // Tomography peaks refine the picture when enough links exist.
    if let Ok(field) = tomography::reconstruct(&samples, &geometry, &config.tomography) {
        for (row, col) in tomography::wall_candidates(&field, &config.tomography) {
            walls.deposit(row, col, field.get(row, col) as f32);
        }
    }
    walls
}

/// Partitions the non-wall cells into rooms by 4-connected flood fill and
/// derives the doorway topology from near-adjacency across thin walls.
fn partition_rooms(walls: &WallGrid, config: &CalibrationConfig) -> (Vec<Room>, Topology) {
    let geometry = &walls.geometry;
    let threshold = config.wall_attenuation_threshold_db as f32;
    let mut component = vec![usize::MAX; geometry.cell_count()];
    let mut sizes = Vec::new();

    for start in 0..geometry.cell_count() {
        if component[start] != usize::MAX {
            continue;
        }
        let (row, col) = (start / geometry.cols, start % geometry.cols);
        if walls.is_wall(row, col, threshold) {
            continue;
        }
        let id = sizes.len();
        let mut stack = vec![(row, col)];
        let mut size = 0usize;
        while let Some((r, c)) = stack.pop() {
            let idx = geometry.index(r, c);
            if component[idx] != usize::MAX || walls.is_wall(r, c, threshold) {
                continue;
            }
            component[idx] = id;
            size += 1;
            if r > 0 {
                stack.push((r - 1, c));
            }
            if r + 1 < geometry.rows {
                stack.push((r + 1, c));
            }
            if c > 0 {
                stack.push((r, c - 1));
            }
            if c + 1 < geometry.cols {
                stack.push((r, c + 1));
            }
        }
        sizes.push(size);
    }

    // Bounding-box polygon per surviving component.
    let mut bounds: BTreeMap<usize, (usize, usize, usize, usize)> = BTreeMap::new();
    for row in 0..geometry.rows {
        for col in 0..geometry.cols {
            let id = component[geometry.index(row, col)];
            if id == usize::MAX || sizes[id] < config.min_room_cells {
                continue;
            }
            let entry = bounds.entry(id).or_insert((row, col, row, col));
            entry.0 = entry.0.min(row);
            entry.1 = entry.1.min(col);
            entry.2 = entry.2.max(row);
            entry.3 = entry.3.max(col);
        }
    }

    let mut rooms = Vec::new();
    let mut room_index: BTreeMap<usize, String> = BTreeMap::new();
    for (i, (id, (r0, c0, r1, c1))) in bounds.iter().enumerate() {
        let name = format!("room-{i}");
        let min = [
            geometry.origin[0] + *c0 as f64 * geometry.cell_size_m,
            geometry.origin[1] + *r0 as f64 * geometry.cell_size_m,
        ];
        let max = [
            geometry.origin[0] + (*c1 + 1) as f64 * geometry.cell_size_m,
            geometry.origin[1] + (*r1 + 1) as f64 * geometry.cell_size_m,
        ];
        rooms.push(Room::rect(name.clone(), min, max));
        room_index.insert(*id, name);
    }

    // Doorways: two distinct rooms within two cells of each other (one
    // thin wall between them).
    let mut doorways = Vec::new();
    let mut seen: std::collections::BTreeSet<(String, String)> = std::collections::BTreeSet::new();
    let component_at = |r: usize, c: usize| component[geometry.index(r, c)];
    for row in 0..geometry.rows {
        for col in 0..geometry.cols {
            let Some(here) = room_index.get(&component_at(row, col)) else {
                continue;
            };
            let mut probe = |r: usize, c: usize| {
                if let Some(there) = room_index.get(&component_at(r, c)) {
                    if there != here {
                        let key = if here < there {
                            (here.clone(), there.clone())
                        } else {
                            (there.clone(), here.clone())
                        };
                        if seen.insert(key.clone()) {
                            doorways.push(key);
                        }
                    }
                }
            };
            if col + 2 < geometry.cols {
                probe(row, col + 2);
            }
            if row + 2 < geometry.rows {
                probe(row + 2, col);
            }
        }
    }

    let topology = Topology {
        rooms: rooms.iter().map(|r| r.id.clone()).collect(),
        doorways,
    };
    (rooms, topology)
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Builds a floorplan from gathered calibration inputs.
pub fn calibrate_layout(
    inputs: &CalibrationInputs,
    config: &CalibrationConfig,
) -> Result<FloorPlan, CalibrationError> {
    let n = inputs.nodes.len();
    if n < 3 {
        return Err(CalibrationError::InsufficientNodes { available: n });
    }

    let index_of = |node: &NodeId| inputs.nodes.iter().position(|candidate| candidate == node);
    let anchor = match inputs.anchors.first() {
        Some(node) => index_of(node).ok_or(CalibrationError::InsufficientAnchors)?,
        None => 0,
    };
    let second = match inputs.anchors.get(1) {
        Some(node) => Some(index_of(node).ok_or(CalibrationError::InsufficientAnchors)?),
        None => (n > 1).then_some(if anchor == 0 { 1 } else { 0 }),
    };

    let distances = fuse_distance_matrix(
        &inputs.nodes,
        &inputs.acoustic_pairs,
        &inputs.rf_pairs,
        config.hop_cap,
    )?;
    let mut points = mds_2d(&distances);
    canonicalize_layout(&mut points, anchor, second);

    let node_positions: BTreeMap<NodeId, [f64; 2]> = inputs
        .nodes
        .iter()
        .zip(&points)
        .map(|(node, p)| (node.clone(), [p.x, p.y]))
        .collect();
    let position_points: BTreeMap<NodeId, Point2<f64>> = node_positions
        .iter()
        .map(|(node, p)| (node.clone(), Point2::new(p[0], p[1])))
        .collect();

    let geometry = GridGeometry::covering(&points, config.cell_size_m, config.grid_margin_m);
    let walls = detect_walls(&position_points, &inputs.links, geometry, config);
    let (rooms, topology) = partition_rooms(&walls, config);

    Ok(FloorPlan {
        node_positions,
        walls,
        rooms,
        topology,
        baseline_device_rssis: inputs.baseline_device_rssis.clone(),
        built_at_s: inputs.built_at_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn pair(a: &str, b: &str) -> PairKey {
        PairKey::new(node(a), node(b))
    }

    #[test]
    fn mds_recovers_a_rectangle() {
        // 3 x 4 rectangle: distances between corners.
        let d = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, 3.0, 4.0, 5.0, //
                3.0, 0.0, 5.0, 4.0, //
                4.0, 5.0, 0.0, 3.0, //
                5.0, 4.0, 3.0, 0.0,
            ],
        );
        let mut points = mds_2d(&d);
        canonicalize_layout(&mut points, 0, Some(1));

        let expected = [
            Point2::new(0.0, 0.0),
            Point2::new(3.0, 0.0),
            Point2::new(0.0, 4.0),
            Point2::new(3.0, 4.0),
        ];
        for (p, e) in points.iter().zip(&expected) {
            assert!(
                nalgebra::distance(p, e) < 0.01,
                "recovered {p:?} expected {e:?}"
            );
        }
    }

    #[test]
    fn distance_fusion_prefers_acoustic() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let acoustic = BTreeMap::from([(pair("a", "b"), 3.0)]);
        let rf = BTreeMap::from([
            (pair("a", "b"), 9.0),
            (pair("a", "c"), 4.0),
            (pair("b", "c"), 5.0),
        ]);
        let d = fuse_distance_matrix(&nodes, &acoustic, &rf, 3).unwrap();
        assert_relative_eq!(d[(0, 1)], 3.0);
        assert_relative_eq!(d[(0, 2)], 4.0);
        assert_relative_eq!(d[(1, 2)], 5.0);
    }

    #[test]
    fn missing_acoustic_pairs_bridge_over_hops() {
        // a-b and b-c measured acoustically; a-c is bridged a->b->c before
        // any RF fallback is consulted.
        let nodes = vec![node("a"), node("b"), node("c")];
        let acoustic = BTreeMap::from([(pair("a", "b"), 3.0), (pair("b", "c"), 4.0)]);
        let rf = BTreeMap::from([(pair("a", "c"), 40.0)]);
        let d = fuse_distance_matrix(&nodes, &acoustic, &rf, 3).unwrap();
        assert_relative_eq!(d[(0, 2)], 7.0);
    }

    #[test]
    fn hop_cap_bounds_the_bridge() {
        // Chain a-b-c-d-e needs 4 hops to connect a-e; cap is 3.
        let nodes = vec![node("a"), node("b"), node("c"), node("d"), node("e")];
        let acoustic = BTreeMap::from([
            (pair("a", "b"), 1.0),
            (pair("b", "c"), 1.0),
            (pair("c", "d"), 1.0),
            (pair("d", "e"), 1.0),
        ]);
        assert!(acoustic_path_distance(&nodes, &acoustic, 0, 4, 3).is_none());
        assert_relative_eq!(acoustic_path_distance(&nodes, &acoustic, 0, 3, 3).unwrap(), 3.0);
    }

    #[test]
    fn angular_prior_fills_reference_only_pairs() {
        let nodes = vec![node("ref"), node("b"), node("c")];
        let acoustic = BTreeMap::from([(pair("ref", "b"), 3.0), (pair("ref", "c"), 4.0)]);
        let d = fuse_distance_matrix(&nodes, &acoustic, &BTreeMap::new(), 1).unwrap();
        assert_relative_eq!(d[(1, 2)], 5.0);
    }

    #[test]
    fn unresolvable_pair_is_an_error() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let acoustic = BTreeMap::from([(pair("a", "b"), 3.0)]);
        let err = fuse_distance_matrix(&nodes, &acoustic, &BTreeMap::new(), 3).unwrap_err();
        assert!(matches!(err, CalibrationError::IncompleteRanging(_)));
    }

    #[test]
    fn too_few_nodes_fails_fast() {
        let inputs = CalibrationInputs {
            nodes: vec![node("a"), node("b")],
            ..CalibrationInputs::default()
        };
        assert_eq!(
            calibrate_layout(&inputs, &CalibrationConfig::default()),
            Err(CalibrationError::InsufficientNodes { available: 2 })
        );
    }

    #[test]
    fn unknown_anchor_fails() {
        let inputs = CalibrationInputs {
            nodes: vec![node("a"), node("b"), node("c")],
            acoustic_pairs: BTreeMap::from([
                (pair("a", "b"), 3.0),
                (pair("a", "c"), 4.0),
                (pair("b", "c"), 5.0),
            ]),
            anchors: vec![node("zz")],
            ..CalibrationInputs::default()
        };
        assert_eq!(
            calibrate_layout(&inputs, &CalibrationConfig::default()),
            Err(CalibrationError::InsufficientAnchors)
        );
    }

    #[test]
    fn full_layout_produces_a_plan() {
        let inputs = CalibrationInputs {
            nodes: vec![node("a"), node("b"), node("c"), node("d")],
            acoustic_pairs: BTreeMap::from([
                (pair("a", "b"), 3.0),
                (pair("a", "c"), 4.0),
                (pair("a", "d"), 5.0),
                (pair("b", "c"), 5.0),
                (pair("b", "d"), 4.0),
                (pair("c", "d"), 3.0),
            ]),
            links: BTreeMap::from([(
                pair("a", "d"),
                LinkObservation {
                    // Far below the free-space expectation at 5 m: a wall.
                    rssi_dbm: -75.0,
                    confidence: 0.8,
                },
            )]),
            built_at_s: 1000.0,
            ..CalibrationInputs::default()
        };
        let plan = calibrate_layout(&inputs, &CalibrationConfig::default()).unwrap();

        assert_eq!(plan.node_positions.len(), 4);
        // Anchor frame: node a at the origin, node b on +x.
        let a = plan.node_positions[&node("a")];
        let b = plan.node_positions[&node("b")];
        assert!(a[0].abs() < 1e-6 && a[1].abs() < 1e-6);
        assert!(b[1].abs() < 1e-6 && (b[0] - 3.0).abs() < 0.01);

        // The obstructed link painted at least one wall cell.
        let max_cell = plan
            .walls
            .cells
            .iter()
            .copied()
            .fold(0.0f32, f32::max);
        assert!(max_cell >= 6.0, "max wall cell {max_cell}");
        assert!(!plan.rooms.is_empty());
        assert_eq!(plan.built_at_s, 1000.0);
    }
}

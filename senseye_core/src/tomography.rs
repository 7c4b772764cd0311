//! Weighted ridge tomography: link attenuations to a per-cell field.
//!
//! Radio tomographic imaging over the floorplan grid. Each link spreads its
//! excess attenuation over nearby cells through a Gaussian point-to-segment
//! kernel; the confidence of each link becomes a row weight through the
//! shared contract; and an adaptively regularized ridge system recovers the
//! per-cell attenuation field. Every inversion has a fallback: Cholesky
//! first, SVD pseudoinverse on failure, and a hard `IllConditioned` error
//! instead of garbage when even that detects rank deficiency.

use nalgebra::{DMatrix, DVector, Point2};
use thiserror::Error;

use crate::confidence;
use crate::floorplan::{point_to_segment_distance, GridGeometry};

/// One link contribution to the reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSample {
    pub a: Point2<f64>,
    pub b: Point2<f64>,
    /// Excess attenuation over the propagation model, dB.
    pub excess_attenuation_db: f64,
    /// Fused link confidence, (0, 1).
    pub confidence: f64,
}

/// Reconstruction tunables.
#[derive(Debug, Clone)]
pub struct TomographyConfig {
    /// Kernel cutoff radius around each link segment, meters.
    pub kernel_radius_m: f64,

    /// Ridge strength multiplier `kappa`.
    pub ridge_kappa: f64,

    /// Ridge clip range.
    pub alpha_min: f64,
    pub alpha_max: f64,

    /// Wall candidates must reach this fraction of the field peak.
    pub peak_fraction: f64,

    /// And this absolute level, dB.
    pub peak_min_db: f64,
}

impl Default for TomographyConfig {
    fn default() -> Self {
        Self {
            kernel_radius_m: 1.5,
            ridge_kappa: 0.5,
            alpha_min: 0.05,
            alpha_max: 5.0,
            peak_fraction: 0.6,
            peak_min_db: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TomographyError {
    /// Even the pseudoinverse found the system rank-deficient.
    #[error("tomography system is rank-deficient")]
    IllConditioned,
}

/// The reconstructed per-cell attenuation field.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AttenuationField {
    pub geometry: GridGeometry,
    /// Row-major cell values, dB.
    pub values: Vec<f64>,
    /// Ridge strength actually used (zero when nothing was solved).
    pub alpha: f64,
}

impl AttenuationField {
    fn zeros(geometry: GridGeometry) -> Self {
        let values = vec![0.0; geometry.cell_count()];
        Self {
            geometry,
            values,
            alpha: 0.0,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[self.geometry.index(row, col)]
    }

    pub fn max_value(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }

    /// True when no attenuation was reconstructed anywhere.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}

/// Builds the row-normalized influence matrix A.
///
/// `A[i][j]` is the normalized Gaussian kernel of the distance from cell j's
/// center to link i's segment; rows whose kernel sum is zero stay zero and
/// contribute nothing to the solve.
fn influence_matrix(links: &[LinkSample], grid: &GridGeometry, config: &TomographyConfig) -> DMatrix<f64> {
    let n_cells = grid.cell_count();
    let sigma_k = config.kernel_radius_m / 2.0;
    let two_sigma2 = 2.0 * sigma_k * sigma_k;
    let mut a = DMatrix::zeros(links.len(), n_cells);

    for (i, link) in links.iter().enumerate() {
        let mut row_sum = 0.0;
        for row in 0..grid.rows {
            for col in 0..grid.cols {
                let center = grid.cell_center(row, col);
                let d = point_to_segment_distance(&center, &link.a, &link.b);
                if d <= config.kernel_radius_m {
                    let k = (-d * d / two_sigma2).exp();
                    a[(i, grid.index(row, col))] = k;
                    row_sum += k;
                }
            }
        }
        if row_sum > 0.0 {
            for j in 0..n_cells {
                a[(i, j)] /= row_sum;
            }
        }
    }
    a
}

/// Condition-number surrogate: spread of the diagonal of AᵀWA. Cells the
/// links never touch read as zero, which correctly drives the ridge up.
fn condition_estimate(m: &DMatrix<f64>) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi: f64 = 0.0;
    for i in 0..m.nrows() {
        let d = m[(i, i)];
        lo = lo.min(d);
        hi = hi.max(d);
    }
    if hi <= 0.0 {
        return 1.0;
    }
    hi / lo.max(1e-12)
}

/// Reconstructs the attenuation field from link samples.
///
/// With no links there is nothing to solve and the empty field is returned
/// directly.
pub fn reconstruct(
    links: &[LinkSample],
    grid: &GridGeometry,
    config: &TomographyConfig,
) -> Result<AttenuationField, TomographyError> {
    if links.is_empty() {
        return Ok(AttenuationField::zeros(grid.clone()));
    }

    let n_cells = grid.cell_count();
    let a = influence_matrix(links, grid, config);

    // Whiten by the confidence weights: Ā = W^{1/2} A, b̄ = W^{1/2} b.
    let mut a_bar = a;
    let mut b_bar = DVector::zeros(links.len());
    for (i, link) in links.iter().enumerate() {
        let w = confidence::odds(link.confidence).sqrt();
        for j in 0..n_cells {
            a_bar[(i, j)] *= w;
        }
        b_bar[i] = w * link.excess_attenuation_db.max(0.0);
    }

    let normal = a_bar.transpose() * &a_bar;
    let rhs = a_bar.transpose() * &b_bar;

    let cond = condition_estimate(&normal);
    let alpha = (config.ridge_kappa * (n_cells as f64 / links.len() as f64)
        * (1.0 + cond.log10()))
    .clamp(config.alpha_min, config.alpha_max);

    let system = &normal + DMatrix::identity(n_cells, n_cells) * alpha;

    let solution = match system.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => {
            // The ridge should have made the system SPD; if finite
            // precision still defeated Cholesky, fall back to the
            // pseudoinverse and give up only on true rank deficiency.
            let svd = system.svd(true, true);
            let max_sv = svd.singular_values.iter().copied().fold(0.0, f64::max);
            if max_sv <= 0.0 {
                return Err(TomographyError::IllConditioned);
            }
            svd.pseudo_inverse(max_sv * 1e-12)
                .map(|pinv| pinv * &rhs)
                .map_err(|_| TomographyError::IllConditioned)?
        }
    };

    let values: Vec<f64> = solution.iter().map(|&v| v.max(0.0)).collect();
    Ok(AttenuationField {
        geometry: grid.clone(),
        values,
        alpha,
    })
}

/// Extracts wall-candidate cells: above the peak threshold and an axis
/// local maximum among their 4-neighbors (a thinning pass, so a blurred
/// ridge collapses to its crest).
pub fn wall_candidates(field: &AttenuationField, config: &TomographyConfig) -> Vec<(usize, usize)> {
    let peak = field.max_value();
    if peak <= 0.0 {
        return Vec::new();
    }
    let threshold = (peak * config.peak_fraction).max(config.peak_min_db);
    let grid = &field.geometry;
    let mut candidates = Vec::new();

    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let v = field.get(row, col);
            if v < threshold {
                continue;
            }
            let mut local_max = true;
            if row > 0 && field.get(row - 1, col) > v {
                local_max = false;
            }
            if row + 1 < grid.rows && field.get(row + 1, col) > v {
                local_max = false;
            }
            if col > 0 && field.get(row, col - 1) > v {
                local_max = false;
            }
            if col + 1 < grid.cols && field.get(row, col + 1) > v {
                local_max = false;
            }
            if local_max {
                candidates.push((row, col));
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_by_ten() -> GridGeometry {
        GridGeometry {
            origin: [0.0, 0.0],
            cell_size_m: 1.0,
            cols: 10,
            rows: 10,
        }
    }

    #[test]
    fn empty_link_set_returns_empty_field() {
        let field = reconstruct(&[], &ten_by_ten(), &TomographyConfig::default()).unwrap();
        assert!(field.is_empty());
        assert_eq!(field.alpha, 0.0);
    }

    #[test]
    fn single_link_peaks_on_the_segment() {
        // A 5 dB link straight along y = 0 with all the confidence mass.
        let grid = ten_by_ten();
        let config = TomographyConfig::default();
        let links = vec![LinkSample {
            a: Point2::new(0.0, 0.0),
            b: Point2::new(10.0, 0.0),
            excess_attenuation_db: 5.0,
            confidence: 0.95,
        }];

        let field = reconstruct(&links, &grid, &config).unwrap();
        assert!(config.alpha_min <= field.alpha && field.alpha <= config.alpha_max);

        // The peak cells must sit on the bottom row (y of centers = 0.5,
        // nearest the segment).
        let peak = field.max_value();
        assert!(peak > 0.0);
        for col in 0..grid.cols {
            let bottom = field.get(0, col);
            for row in 1..grid.rows {
                assert!(
                    field.get(row, col) <= bottom + 1e-9,
                    "cell ({row},{col}) above bottom row"
                );
            }
        }

        let candidates = wall_candidates(&field, &config);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|&(row, _)| row == 0));
    }

    #[test]
    fn influence_rows_are_normalized() {
        let grid = ten_by_ten();
        let config = TomographyConfig::default();
        let links = vec![
            LinkSample {
                a: Point2::new(0.0, 0.0),
                b: Point2::new(10.0, 0.0),
                excess_attenuation_db: 5.0,
                confidence: 0.9,
            },
            LinkSample {
                a: Point2::new(0.0, 5.0),
                b: Point2::new(10.0, 5.0),
                excess_attenuation_db: 2.0,
                confidence: 0.5,
            },
        ];
        let a = influence_matrix(&links, &grid, &config);
        for i in 0..a.nrows() {
            let sum: f64 = a.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "row {i} sums to {sum}");
        }
    }

    #[test]
    fn out_of_reach_link_contributes_nothing() {
        let grid = ten_by_ten();
        let config = TomographyConfig::default();
        // Segment far outside the grid: kernel row is all zeros.
        let links = vec![LinkSample {
            a: Point2::new(100.0, 100.0),
            b: Point2::new(110.0, 100.0),
            excess_attenuation_db: 9.0,
            confidence: 0.9,
        }];
        let field = reconstruct(&links, &grid, &config).unwrap();
        assert!(field.is_empty());
    }

    #[test]
    fn higher_confidence_reconstructs_stronger_field() {
        let grid = ten_by_ten();
        let config = TomographyConfig::default();
        let link = |confidence| {
            vec![LinkSample {
                a: Point2::new(0.0, 5.0),
                b: Point2::new(10.0, 5.0),
                excess_attenuation_db: 5.0,
                confidence,
            }]
        };
        let strong = reconstruct(&link(0.95), &grid, &config).unwrap();
        let weak = reconstruct(&link(0.2), &grid, &config).unwrap();
        assert!(strong.max_value() > weak.max_value());
    }

    #[test]
    fn crossing_links_localize_the_intersection() {
        let grid = ten_by_ten();
        let config = TomographyConfig::default();
        // Two attenuated links crossing near (5, 5).
        let links = vec![
            LinkSample {
                a: Point2::new(0.0, 5.0),
                b: Point2::new(10.0, 5.0),
                excess_attenuation_db: 6.0,
                confidence: 0.9,
            },
            LinkSample {
                a: Point2::new(5.0, 0.0),
                b: Point2::new(5.0, 10.0),
                excess_attenuation_db: 6.0,
                confidence: 0.9,
            },
        ];
        let field = reconstruct(&links, &grid, &config).unwrap();
        // The intersection cell must carry more attenuation than a cell on
        // only one of the links.
        let crossing = field.get(5, 5);
        let single = field.get(5, 1);
        assert!(crossing > single, "crossing {crossing} single {single}");
    }
}

//! Robust weighted trilateration.
//!
//! Solves for a 2D position from anchor ranges by iteratively reweighted
//! least squares: a range-dependent noise model sets base weights, a Tukey
//! biweight zeroes out gross outliers, and a Levenberg-damped Gauss-Newton
//! step keeps the normal equations solvable near degenerate geometry. For
//! small anchor sets the solver additionally evaluates leave-one-out and
//! all size-3 subsets so a single lying anchor cannot drag the fix.

use nalgebra::{Matrix2, Point2, Vector2};
use thiserror::Error;

/// One anchor with a measured range to the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub position: Point2<f64>,
    pub range_m: f64,
}

impl Anchor {
    pub fn new(x: f64, y: f64, range_m: f64) -> Self {
        Self {
            position: Point2::new(x, y),
            range_m,
        }
    }
}

/// Solver tunables.
#[derive(Debug, Clone)]
pub struct TrilaterationConfig {
    /// IRLS iteration budget.
    pub max_iterations: usize,

    /// Convergence threshold on the step norm, meters.
    pub tolerance_m: f64,

    /// Levenberg damping added to the normal equations.
    pub damping: f64,

    /// Normalized-residual bound for inlier classification.
    pub inlier_cutoff: f64,

    /// Subset search is exhaustive up to this many anchors.
    pub subset_search_max: usize,
}

impl Default for TrilaterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance_m: 1e-4,
            damping: 1e-4,
            inlier_cutoff: 2.5,
            subset_search_max: 6,
        }
    }
}

/// Trilateration failure modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrilaterationError {
    #[error("need at least 3 anchors, got {available}")]
    InsufficientAnchors { available: usize },

    #[error("IRLS did not converge within the iteration budget")]
    Divergence,
}

/// A converged position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub position: Point2<f64>,
    /// Anchors within the inlier cutoff at the solution.
    pub inliers: usize,
    /// RMS of the inlier residuals, meters.
    pub rms_residual_m: f64,
    pub iterations: usize,
}

/// Range-dependent measurement noise, meters.
fn sigma(range_m: f64) -> f64 {
    (0.08 * range_m + 0.2).max(0.35)
}

/// Tukey biweight factor for a residual at the given noise level.
fn tukey(residual: f64, sigma_m: f64) -> f64 {
    let cutoff = 2.5 * sigma_m;
    let ratio = residual.abs() / cutoff;
    if ratio >= 1.0 {
        0.0
    } else {
        let t = 1.0 - ratio * ratio;
        t * t
    }
}

/// Precision-weighted centroid seed.
fn weighted_centroid(anchors: &[&Anchor]) -> Point2<f64> {
    let mut sum = Vector2::zeros();
    let mut total = 0.0;
    for a in anchors {
        let w = 1.0 / sigma(a.range_m).powi(2);
        sum += a.position.coords * w;
        total += w;
    }
    Point2::from(sum / total.max(1e-12))
}

/// Linear algebraic seed: subtracting the first circle equation from the
/// rest gives a linear system in (x, y). Falls back to the centroid when
/// the geometry is degenerate (collinear anchors).
fn linear_seed(anchors: &[&Anchor]) -> Option<Point2<f64>> {
    if anchors.len() < 3 {
        return None;
    }
    let a0 = anchors[0];
    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for a in &anchors[1..] {
        let row = Vector2::new(
            2.0 * (a.position.x - a0.position.x),
            2.0 * (a.position.y - a0.position.y),
        );
        let rhs = a.position.coords.norm_squared() - a0.position.coords.norm_squared()
            + a0.range_m.powi(2)
            - a.range_m.powi(2);
        ata += row * row.transpose();
        atb += row * rhs;
    }
    let det = ata[(0, 0)] * ata[(1, 1)] - ata[(0, 1)] * ata[(1, 0)];
    if det.abs() < 1e-9 {
        return None;
    }
    ata.try_inverse().map(|inv| Point2::from(inv * atb))
}

/// One IRLS solve over a fixed anchor subset. Returns the converged
/// position and iteration count, or None on divergence.
fn irls(
    anchors: &[&Anchor],
    seed: Point2<f64>,
    config: &TrilaterationConfig,
) -> Option<(Point2<f64>, usize)> {
    let mut x = seed;

    for iteration in 0..config.max_iterations {
        let mut jtwj = Matrix2::zeros();
        let mut jtwr = Vector2::zeros();

        for a in anchors {
            let delta = x - a.position;
            let estimated = delta.norm().max(1e-9);
            let residual = estimated - a.range_m;
            let s = sigma(a.range_m);
            let weight = tukey(residual, s) / (s * s);
            if weight <= 0.0 {
                continue;
            }
            let jac = delta / estimated;
            jtwj += jac * jac.transpose() * weight;
            jtwr += jac * (weight * residual);
        }

        // Levenberg damping keeps the step defined when the active set
        // degenerates (all anchors rejected or collinear geometry).
        let mut lambda = config.damping;
        let step = loop {
            let damped = jtwj + Matrix2::identity() * lambda;
            match damped.try_inverse() {
                Some(inv) => break Some(inv * jtwr),
                None => {
                    lambda *= 10.0;
                    if lambda > 1e6 {
                        break None;
                    }
                }
            }
        }?;

        x -= step;
        if step.norm() < config.tolerance_m {
            return Some((x, iteration + 1));
        }
    }
    None
}

/// Normalized residual `rho = |r| / sigma` per anchor at a position.
fn normalized_residuals(anchors: &[Anchor], x: &Point2<f64>) -> Vec<f64> {
    anchors
        .iter()
        .map(|a| {
            let r = nalgebra::distance(x, &a.position) - a.range_m;
            r.abs() / sigma(a.range_m)
        })
        .collect()
}

/// Candidate score: maximize inliers, then minimize the mean capped squared
/// normalized residual.
fn score(rhos: &[f64], cutoff: f64) -> (usize, f64) {
    let inliers = rhos.iter().filter(|&&r| r <= cutoff).count();
    let mean_capped =
        rhos.iter().map(|r| (r * r).min(9.0)).sum::<f64>() / rhos.len().max(1) as f64;
    (inliers, mean_capped)
}

/// Solves for a position from anchor ranges.
pub fn solve(anchors: &[Anchor], config: &TrilaterationConfig) -> Result<Fix, TrilaterationError> {
    if anchors.len() < 3 {
        return Err(TrilaterationError::InsufficientAnchors {
            available: anchors.len(),
        });
    }

    let mut subsets: Vec<Vec<usize>> = vec![(0..anchors.len()).collect()];
    if anchors.len() <= config.subset_search_max {
        // Leave-one-out keeps n-1 >= 3.
        if anchors.len() > 3 {
            for skip in 0..anchors.len() {
                subsets.push((0..anchors.len()).filter(|&i| i != skip).collect());
            }
        }
        // All size-3 subsets pin down the single-outlier cases.
        for i in 0..anchors.len() {
            for j in (i + 1)..anchors.len() {
                for k in (j + 1)..anchors.len() {
                    subsets.push(vec![i, j, k]);
                }
            }
        }
    }

    let mut best: Option<(usize, f64, Point2<f64>, usize)> = None;
    for subset in &subsets {
        let members: Vec<&Anchor> = subset.iter().map(|&i| &anchors[i]).collect();
        let seed = linear_seed(&members).unwrap_or_else(|| weighted_centroid(&members));
        let Some((candidate, iterations)) = irls(&members, seed, config) else {
            continue;
        };
        let rhos = normalized_residuals(anchors, &candidate);
        let (inliers, mean_capped) = score(&rhos, config.inlier_cutoff);

        let better = match &best {
            None => true,
            Some((best_inliers, best_cost, _, _)) => {
                inliers > *best_inliers || (inliers == *best_inliers && mean_capped < *best_cost)
            }
        };
        if better {
            best = Some((inliers, mean_capped, candidate, iterations));
        }
    }

    let (_, _, mut position, mut iterations) = best.ok_or(TrilaterationError::Divergence)?;

    // Refit on the inlier set when enough anchors survive.
    let rhos = normalized_residuals(anchors, &position);
    let inlier_set: Vec<&Anchor> = anchors
        .iter()
        .zip(&rhos)
        .filter(|(_, &r)| r <= config.inlier_cutoff)
        .map(|(a, _)| a)
        .collect();
    if inlier_set.len() >= 3 {
        if let Some((refined, refit_iterations)) = irls(&inlier_set, position, config) {
            position = refined;
            iterations += refit_iterations;
        }
    }

    let rhos = normalized_residuals(anchors, &position);
    let inlier_residuals: Vec<f64> = anchors
        .iter()
        .zip(&rhos)
        .filter(|(_, &r)| r <= config.inlier_cutoff)
        .map(|(a, _)| nalgebra::distance(&position, &a.position) - a.range_m)
        .collect();
    let inliers = inlier_residuals.len();
    let rms_residual_m = if inliers > 0 {
        (inlier_residuals.iter().map(|r| r * r).sum::<f64>() / inliers as f64).sqrt()
    } else {
        f64::INFINITY
    };

    Ok(Fix {
        position,
        inliers,
        rms_residual_m,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_anchors(target: Point2<f64>, positions: &[(f64, f64)]) -> Vec<Anchor> {
        positions
            .iter()
            .map(|&(x, y)| {
                let p = Point2::new(x, y);
                Anchor {
                    position: p,
                    range_m: nalgebra::distance(&p, &target),
                }
            })
            .collect()
    }

    #[test]
    fn exact_three_anchor_solve() {
        let target = Point2::new(3.0, 4.0);
        let anchors = exact_anchors(target, &[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)]);
        let fix = solve(&anchors, &TrilaterationConfig::default()).unwrap();
        assert!(nalgebra::distance(&fix.position, &target) < 0.01);
        assert_eq!(fix.inliers, 3);
    }

    #[test]
    fn two_anchors_is_insufficient() {
        let anchors = vec![Anchor::new(0.0, 0.0, 5.0), Anchor::new(10.0, 0.0, 5.0)];
        assert_eq!(
            solve(&anchors, &TrilaterationConfig::default()),
            Err(TrilaterationError::InsufficientAnchors { available: 2 })
        );
    }

    #[test]
    fn single_outlier_is_rejected() {
        // Four consistent anchors around the target plus one lying anchor
        // reporting an absurd range. The subset search must keep the four.
        let anchors = vec![
            Anchor::new(0.0, 0.0, 5.0),
            Anchor::new(10.0, 0.0, 7.28),
            Anchor::new(0.0, 10.0, 6.71),
            Anchor::new(10.0, 10.0, 9.22),
            Anchor::new(5.0, 5.0, 20.0),
        ];
        let fix = solve(&anchors, &TrilaterationConfig::default()).unwrap();
        assert_eq!(fix.inliers, 4, "bad anchor must be excluded");
        let target = Point2::new(3.0, 4.0);
        let err = nalgebra::distance(&fix.position, &target);
        assert!(err < 0.5, "position error {err:.3} m at {:?}", fix.position);
    }

    #[test]
    fn collinear_anchors_do_not_crash() {
        // Degenerate geometry: solution is ambiguous across the line, but
        // the solver must return Ok or Divergence, never panic.
        let target = Point2::new(5.0, 2.0);
        let anchors = exact_anchors(target, &[(0.0, 0.0), (5.0, 0.0), (10.0, 0.0)]);
        match solve(&anchors, &TrilaterationConfig::default()) {
            Ok(fix) => {
                // The mirror ambiguity collapses onto the anchor line; the
                // fix must still be finite and well-defined.
                assert!(fix.position.x.is_finite() && fix.position.y.is_finite());
            }
            Err(TrilaterationError::Divergence) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn noisy_ranges_converge_close() {
        let target = Point2::new(4.0, 7.0);
        let mut anchors = exact_anchors(
            target,
            &[(0.0, 0.0), (12.0, 0.0), (0.0, 12.0), (12.0, 12.0)],
        );
        // Mild correlated noise.
        for (i, a) in anchors.iter_mut().enumerate() {
            a.range_m += if i % 2 == 0 { 0.2 } else { -0.2 };
        }
        let fix = solve(&anchors, &TrilaterationConfig::default()).unwrap();
        assert!(nalgebra::distance(&fix.position, &target) < 0.5);
        assert!(fix.rms_residual_m < 0.5);
    }
}

//! The shared confidence-to-precision contract.
//!
//! Every fusion stage in the pipeline speaks the same numerical language:
//! a confidence `c` in (0,1) maps to a variance
//!
//! ```text
//! c_eff = clamp(c, 0.01, 0.99)
//! sigma²(c) = (1 - c_eff) / c_eff + EPSILON
//! pi(c)     = 1 / sigma²(c)
//! ```
//!
//! and estimates combine as inverse-variance weighted means. Consensus
//! fusion, device ranging, and the tomography weight matrix all derive
//! their weights from this one mapping, so agreement between subsystems is
//! commensurable.

/// Variance floor keeping the precision finite at c_eff = 0.99.
pub const EPSILON: f64 = 1e-6;

/// Lower confidence clamp.
pub const MIN_CONFIDENCE: f64 = 0.01;

/// Upper confidence clamp.
pub const MAX_CONFIDENCE: f64 = 0.99;

/// Clamps a raw confidence into the effective range.
#[inline]
pub fn effective(c: f64) -> f64 {
    if c.is_finite() {
        c.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    } else {
        MIN_CONFIDENCE
    }
}

/// Variance implied by a confidence. At c = 0.5 this is exactly 1 + EPSILON.
#[inline]
pub fn variance(c: f64) -> f64 {
    let c_eff = effective(c);
    (1.0 - c_eff) / c_eff + EPSILON
}

/// Precision (inverse variance) implied by a confidence.
///
/// Strictly increasing in the effective confidence.
#[inline]
pub fn precision(c: f64) -> f64 {
    1.0 / variance(c)
}

/// Odds form `c_eff / (1 - c_eff)` used by the tomography weight matrix.
///
/// Identical to [`precision`] up to the EPSILON floor.
#[inline]
pub fn odds(c: f64) -> f64 {
    let c_eff = effective(c);
    c_eff / (1.0 - c_eff)
}

/// Maps an accumulated total precision back to a confidence.
///
/// `c_base = pi_total / (1 + pi_total)`: more independent agreeing
/// contributions push the fused confidence above any single input.
#[inline]
pub fn base_confidence(total_precision: f64) -> f64 {
    total_precision / (1.0 + total_precision)
}

/// Penalty factor `1 / (1 + scale * disagreement_variance)`.
#[inline]
pub fn disagreement_penalty(disagreement_variance: f64, scale: f64) -> f64 {
    1.0 / (1.0 + scale * disagreement_variance.max(0.0))
}

/// Streaming precision-weighted mean.
///
/// Accumulates `sum(w)`, `sum(w*x)`, and `sum(w*x²)` so the weighted mean
/// and the disagreement variance `v = sum(w*(x - mean)²) / sum(w)` come out
/// of one pass. Commutative and associative up to floating point, so the
/// order peers are folded in does not matter.
#[derive(Debug, Clone, Default)]
pub struct WeightedMean {
    sum_w: f64,
    sum_wx: f64,
    sum_wx2: f64,
    min: f64,
    max: f64,
    count: usize,
}

impl WeightedMean {
    pub fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Self::default()
        }
    }

    /// Folds in one contribution with weight `w`. Non-positive or non-finite
    /// weights are ignored.
    pub fn add(&mut self, x: f64, w: f64) {
        if !(w > 0.0) || !w.is_finite() || !x.is_finite() {
            return;
        }
        self.sum_w += w;
        self.sum_wx += w * x;
        self.sum_wx2 += w * x * x;
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        self.count += 1;
    }

    /// Number of contributions folded in.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Total accumulated weight.
    pub fn total_weight(&self) -> f64 {
        self.sum_w
    }

    /// Weighted mean, clamped into the observed [min, max] envelope to keep
    /// the bounded-fusion invariant exact under floating point.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 || self.sum_w <= 0.0 {
            return None;
        }
        Some((self.sum_wx / self.sum_w).clamp(self.min, self.max))
    }

    /// Weighted disagreement variance around the mean. Zero when all
    /// contributions agree.
    pub fn disagreement(&self) -> f64 {
        match self.mean() {
            Some(mean) => (self.sum_wx2 / self.sum_w - mean * mean).max(0.0),
            None => 0.0,
        }
    }
}

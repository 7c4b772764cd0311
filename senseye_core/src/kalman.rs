//! Adaptive Kalman bank: one 2-state filter per signal path.
//!
//! Each (source, target, kind) path carries a constant-velocity filter over
//! its RSSI: state `[rssi, rssi_rate]`, scalar observation. The bank smooths
//! scan noise while staying responsive to abrupt environmental shifts via
//! innovation-gated process-noise inflation.
//!
//! Numerical contracts:
//! - The covariance update uses the Joseph form, is re-symmetrized after
//!   every step, and has negative eigenvalues clipped to zero.
//! - The innovation variance is floored before any division.
//! - Out-of-order measurements older than the last applied sample are
//!   discarded; paths silent beyond the TTL are purged.

use nalgebra::{Matrix2, Vector2};
use std::collections::{HashMap, VecDeque};

use senseye_env::{Measurement, NodeId, SignalKind};

/// Variance floor applied to the innovation variance `S`.
const S_FLOOR: f64 = 1e-9;

/// Initial variance on the unobserved rate state, (dB/s)².
const INITIAL_RATE_VARIANCE: f64 = 25.0;

/// Configuration for the filter bank.
#[derive(Debug, Clone)]
pub struct KalmanConfig {
    /// Process noise intensity `q` (continuous white-noise acceleration).
    pub process_noise: f64,

    /// Measurement variance R for WiFi RSSI, dB².
    pub wifi_variance: f64,

    /// Measurement variance R for BLE RSSI, dB² (noisier radios).
    pub ble_variance: f64,

    /// Innovation z-score above which a step is treated as a jump.
    pub jump_zscore: f64,

    /// Process-noise multiplier applied on a jump step.
    pub jump_boost: f64,

    /// Ring-buffer window of filtered RSSI values kept per path.
    pub window: usize,

    /// Paths silent longer than this are purged, seconds.
    pub path_ttl_s: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.1,
            wifi_variance: 4.0,
            ble_variance: 6.0,
            jump_zscore: 3.0,
            jump_boost: 50.0,
            window: 20,
            path_ttl_s: 30.0,
        }
    }
}

impl KalmanConfig {
    /// Measurement variance for an RF kind.
    fn measurement_variance(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Wifi => self.wifi_variance,
            SignalKind::Ble => self.ble_variance,
            // Acoustic measurements are distances and bypass the bank.
            SignalKind::Acoustic => self.wifi_variance,
        }
    }
}

/// Identifies one signal path through the bank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: SignalKind,
}

/// Per-path filter state.
#[derive(Debug, Clone)]
pub struct PathFilter {
    /// State mean `[rssi, rssi_rate]`.
    state: Vector2<f64>,

    /// State covariance, kept symmetric positive semi-definite.
    covariance: Matrix2<f64>,

    /// Timestamp of the last applied measurement.
    last_update_s: f64,

    /// Ring buffer of recent filtered RSSI values.
    window: VecDeque<f64>,

    /// Last innovation `y = z - H x⁻`.
    last_innovation: f64,

    /// Last innovation variance `S`.
    innovation_variance: f64,
}

impl PathFilter {
    fn new(rssi: f64, timestamp_s: f64, r: f64, window: usize) -> Self {
        let mut buf = VecDeque::with_capacity(window);
        buf.push_back(rssi);
        Self {
            state: Vector2::new(rssi, 0.0),
            covariance: Matrix2::new(r, 0.0, 0.0, INITIAL_RATE_VARIANCE),
            last_update_s: timestamp_s,
            window: buf,
            last_innovation: 0.0,
            innovation_variance: r,
        }
    }

    /// Filtered RSSI estimate, dBm.
    pub fn rssi(&self) -> f64 {
        self.state[0]
    }

    /// Estimated RSSI rate, dB/s.
    pub fn rate(&self) -> f64 {
        self.state[1]
    }

    /// Current covariance.
    pub fn covariance(&self) -> &Matrix2<f64> {
        &self.covariance
    }

    /// Timestamp of the last applied measurement.
    pub fn last_update_s(&self) -> f64 {
        self.last_update_s
    }

    /// Last innovation.
    pub fn innovation(&self) -> f64 {
        self.last_innovation
    }

    /// Last innovation variance.
    pub fn innovation_variance(&self) -> f64 {
        self.innovation_variance
    }

    /// Number of samples currently in the ring buffer.
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Unbiased variance of the ring buffer, dB². Zero with fewer than two
    /// samples.
    pub fn window_variance(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.window.iter().sum::<f64>() / n as f64;
        self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    }

    /// Predicted mean and covariance `dt` seconds ahead, with process noise
    /// scaled by `q_scale`. Pure; also used for the predict-only property.
    pub fn predicted(&self, dt: f64, q: f64, q_scale: f64) -> (Vector2<f64>, Matrix2<f64>) {
        let f = Matrix2::new(1.0, dt, 0.0, 1.0);
        let dt2 = dt * dt;
        let q_eff = q * q_scale;
        let process = Matrix2::new(
            q_eff * dt2 * dt2 / 4.0,
            q_eff * dt2 * dt / 2.0,
            q_eff * dt2 * dt / 2.0,
            q_eff * dt2,
        );
        let mean = f * self.state;
        let cov = f * self.covariance * f.transpose() + process;
        (mean, cov)
    }

    /// Applies one measurement. Returns false when the sample is older than
    /// the last applied one (discarded without touching state).
    fn update(&mut self, z: f64, timestamp_s: f64, r: f64, config: &KalmanConfig) -> bool {
        let dt = timestamp_s - self.last_update_s;
        if dt < 0.0 {
            return false;
        }
        // Coalesced scans can share a timestamp; treat them as a short step.
        let dt = dt.max(1e-3);

        let (x_prior, p_prior) = self.predicted(dt, config.process_noise, 1.0);
        let y = z - x_prior[0];
        let s = (p_prior[(0, 0)] + r).max(S_FLOOR);

        // Jump gate: inflate process noise for this step only, so a genuine
        // environmental shift is tracked without destabilizing steady state.
        let z_score = y.abs() / s.sqrt();
        let (x_prior, p_prior, s) = if z_score > config.jump_zscore {
            let (x_j, p_j) = self.predicted(dt, config.process_noise, config.jump_boost);
            let s_j = (p_j[(0, 0)] + r).max(S_FLOOR);
            (x_j, p_j, s_j)
        } else {
            (x_prior, p_prior, s)
        };
        let y = z - x_prior[0];

        // Gain K = P⁻ Hᵀ / S with H = [1, 0].
        let k = Vector2::new(p_prior[(0, 0)] / s, p_prior[(1, 0)] / s);

        self.state = x_prior + k * y;

        // Joseph form: (I - K H) P⁻ (I - K H)ᵀ + K R Kᵀ.
        let h = nalgebra::RowVector2::new(1.0, 0.0);
        let i_kh = Matrix2::identity() - k * h;
        self.covariance = i_kh * p_prior * i_kh.transpose() + k * r * k.transpose();
        self.condition_covariance();

        self.last_update_s = timestamp_s;
        self.last_innovation = y;
        self.innovation_variance = s;

        if self.window.len() == config.window {
            self.window.pop_front();
        }
        self.window.push_back(self.state[0]);
        true
    }

    /// Re-symmetrizes and clips negative eigenvalues to zero.
    fn condition_covariance(&mut self) {
        let p = &self.covariance;
        let sym = Matrix2::new(
            p[(0, 0)],
            (p[(0, 1)] + p[(1, 0)]) / 2.0,
            (p[(0, 1)] + p[(1, 0)]) / 2.0,
            p[(1, 1)],
        );
        let eigen = nalgebra::SymmetricEigen::new(sym);
        if eigen.eigenvalues.iter().any(|&l| l < 0.0) {
            let clipped = eigen.eigenvalues.map(|l| l.max(0.0));
            let v = eigen.eigenvectors;
            self.covariance = v * Matrix2::from_diagonal(&clipped) * v.transpose();
        } else {
            self.covariance = sym;
        }
    }
}

/// The filter bank: lazily creates a filter per observed path, purges silent
/// ones.
#[derive(Debug, Default)]
pub struct FilterBank {
    paths: HashMap<PathKey, PathFilter>,
    config: KalmanConfig,
}

impl FilterBank {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            paths: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &KalmanConfig {
        &self.config
    }

    /// Routes one measurement into its path filter. Acoustic measurements
    /// carry distances, not RSSI, and are not filtered here; the caller
    /// hands them to the calibration path instead. Returns true when the
    /// sample was applied.
    pub fn ingest(&mut self, m: &Measurement) -> bool {
        if !m.kind.is_rf() || !m.value.is_finite() {
            return false;
        }
        let key = PathKey {
            source: m.source.clone(),
            target: m.target.clone(),
            kind: m.kind,
        };
        let r = self.config.measurement_variance(m.kind);
        match self.paths.get_mut(&key) {
            Some(filter) => filter.update(m.value, m.timestamp_s, r, &self.config),
            None => {
                self.paths.insert(
                    key,
                    PathFilter::new(m.value, m.timestamp_s, r, self.config.window),
                );
                true
            }
        }
    }

    /// Drops paths silent beyond the TTL.
    pub fn purge(&mut self, now_s: f64) {
        let ttl = self.config.path_ttl_s;
        self.paths
            .retain(|_, f| now_s - f.last_update_s() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn get(&self, key: &PathKey) -> Option<&PathFilter> {
        self.paths.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathKey, &PathFilter)> {
        self.paths.iter()
    }
}

//! Ultrasonic chirp synthesis and matched filtering.
//!
//! Each node owns one of six near-ultrasonic 1 kHz bands, assigned by
//! hashing its id, so overlapping chirps from different nodes stay
//! separable: the receiver correlates against the *target's* band template
//! and ignores everything else. Ranging is one-way time-of-flight against
//! the scheduled play time carried in the acoustic ping.

use rustfft::{num_complex::Complex, FftPlanner};
use sha2::{Digest, Sha256};

use senseye_env::NodeId;

/// Number of chirp channels.
pub const CHANNEL_COUNT: u64 = 6;

/// First channel start frequency, Hz.
pub const CHANNEL_BASE_HZ: f64 = 17_000.0;

/// Channel width, Hz.
pub const CHANNEL_WIDTH_HZ: f64 = 1_000.0;

/// Speed of sound used for ranging, m/s.
pub const SPEED_OF_SOUND_M_S: f64 = 343.0;

/// A node's chirp frequency band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChirpBand {
    pub freq_start_hz: f64,
    pub freq_end_hz: f64,
}

/// Deterministic band assignment: `k = SHA256(node_id) mod 6`.
pub fn chirp_band(node: &NodeId) -> ChirpBand {
    let digest = Sha256::digest(node.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let k = (u64::from_be_bytes(prefix) % CHANNEL_COUNT) as f64;
    let freq_start_hz = CHANNEL_BASE_HZ + CHANNEL_WIDTH_HZ * k;
    ChirpBand {
        freq_start_hz,
        freq_end_hz: freq_start_hz + CHANNEL_WIDTH_HZ,
    }
}

/// Synthesizes a Hann-windowed linear chirp.
pub fn synthesize_chirp(band: ChirpBand, duration_s: f64, sample_rate: u32) -> Vec<f32> {
    let n = (duration_s * sample_rate as f64).round().max(1.0) as usize;
    let sweep_rate = (band.freq_end_hz - band.freq_start_hz) / duration_s;
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            // Instantaneous phase of a linear sweep.
            let phase = 2.0 * std::f64::consts::PI * (band.freq_start_hz * t + 0.5 * sweep_rate * t * t);
            let window = 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos());
            (phase.sin() * window) as f32
        })
        .collect()
}

/// Result of correlating a recording against a chirp template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedFilterResult {
    /// Sample offset of the correlation peak within the recording.
    pub peak_index: usize,
    /// Peak magnitude over off-peak RMS.
    pub peak_snr: f64,
    /// Peak offset in seconds.
    pub delay_s: f64,
}

/// Cross-correlates `recording` with `template` via FFT and reports the
/// strongest arrival. Returns `None` when either input is empty or the
/// correlation is degenerate (silent recording).
pub fn matched_filter(
    recording: &[f32],
    template: &[f32],
    sample_rate: u32,
) -> Option<MatchedFilterResult> {
    if recording.is_empty() || template.is_empty() || recording.len() < template.len() {
        return None;
    }

    let corr_len = recording.len() + template.len() - 1;
    let fft_len = corr_len.next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_len);
    let ifft = planner.plan_fft_inverse(fft_len);

    let mut rec: Vec<Complex<f64>> = recording
        .iter()
        .map(|&s| Complex::new(s as f64, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(fft_len)
        .collect();
    let mut tpl: Vec<Complex<f64>> = template
        .iter()
        .map(|&s| Complex::new(s as f64, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(fft_len)
        .collect();

    fft.process(&mut rec);
    fft.process(&mut tpl);
    for (r, t) in rec.iter_mut().zip(&tpl) {
        *r *= t.conj();
    }
    ifft.process(&mut rec);

    // Valid lags: template fully inside the recording.
    let valid = recording.len() - template.len() + 1;
    let magnitudes: Vec<f64> = rec[..valid].iter().map(|c| c.norm()).collect();
    let (peak_index, &peak) = magnitudes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if peak <= 0.0 {
        return None;
    }

    // Off-peak RMS, excluding the main-lobe neighborhood of the peak.
    let guard = template.len().min(valid / 4).max(1);
    let mut off_peak_energy = 0.0;
    let mut off_peak_count = 0usize;
    for (i, &m) in magnitudes.iter().enumerate() {
        if i.abs_diff(peak_index) > guard {
            off_peak_energy += m * m;
            off_peak_count += 1;
        }
    }
    let peak_snr = if off_peak_count == 0 {
        f64::INFINITY
    } else {
        let rms = (off_peak_energy / off_peak_count as f64).sqrt();
        if rms <= 0.0 {
            f64::INFINITY
        } else {
            peak / rms
        }
    };

    Some(MatchedFilterResult {
        peak_index,
        peak_snr,
        delay_s: peak_index as f64 / sample_rate as f64,
    })
}

/// One-way time-of-flight distance given the scheduled chirp play time and
/// the arrival found in the capture. Floored at 0.1 m; negative flight
/// times (clock skew beyond the chirp spacing) report the floor.
pub fn range_from_arrival(scheduled_play_s: f64, capture_start_s: f64, delay_in_capture_s: f64) -> f64 {
    let arrival_s = capture_start_s + delay_in_capture_s;
    let tof_s = arrival_s - scheduled_play_s;
    (tof_s * SPEED_OF_SOUND_M_S).max(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_assignment_is_deterministic_and_in_range() {
        let a1 = chirp_band(&NodeId::new("kitchen"));
        let a2 = chirp_band(&NodeId::new("kitchen"));
        assert_eq!(a1, a2);

        for name in ["a", "b", "kitchen", "atrium", "node-42"] {
            let band = chirp_band(&NodeId::new(name));
            assert!(band.freq_start_hz >= CHANNEL_BASE_HZ);
            assert!(band.freq_start_hz <= CHANNEL_BASE_HZ + 5.0 * CHANNEL_WIDTH_HZ);
            assert_eq!(band.freq_end_hz - band.freq_start_hz, CHANNEL_WIDTH_HZ);
        }
    }

    #[test]
    fn chirp_has_requested_length_and_is_windowed() {
        let band = chirp_band(&NodeId::new("n"));
        let chirp = synthesize_chirp(band, 0.05, 48_000);
        assert_eq!(chirp.len(), 2400);
        // Hann window pins the endpoints near zero.
        assert!(chirp[0].abs() < 1e-6);
        assert!(chirp.iter().any(|&s| s.abs() > 0.5));
    }

    #[test]
    fn matched_filter_finds_embedded_chirp() {
        let band = ChirpBand {
            freq_start_hz: 17_000.0,
            freq_end_hz: 18_000.0,
        };
        let sample_rate = 48_000;
        let template = synthesize_chirp(band, 0.05, sample_rate);

        let offset = 4800; // 100 ms into the capture
        let mut recording = vec![0.0f32; 24_000];
        for (i, &s) in template.iter().enumerate() {
            recording[offset + i] += 0.8 * s;
        }

        let result = matched_filter(&recording, &template, sample_rate).unwrap();
        assert!(
            result.peak_index.abs_diff(offset) <= 2,
            "peak at {} expected {}",
            result.peak_index,
            offset
        );
        assert!(result.peak_snr > 5.0, "snr {}", result.peak_snr);
        assert!((result.delay_s - 0.1).abs() < 1e-3);
    }

    #[test]
    fn matched_filter_rejects_degenerate_input() {
        let template = synthesize_chirp(
            ChirpBand {
                freq_start_hz: 17_000.0,
                freq_end_hz: 18_000.0,
            },
            0.05,
            48_000,
        );
        assert!(matched_filter(&[], &template, 48_000).is_none());
        assert!(matched_filter(&template[..10], &template, 48_000).is_none());
        // Silence has no peak.
        assert!(matched_filter(&vec![0.0; 10_000], &template, 48_000).is_none());
    }

    #[test]
    fn range_from_arrival_matches_flight_time() {
        // Chirp scheduled at t = 100.0, heard 10 ms later: 3.43 m away.
        let d = range_from_arrival(100.0, 100.002, 0.008);
        assert!((d - 3.43).abs() < 1e-6);
        // Skewed clocks cannot produce a negative range.
        assert_eq!(range_from_arrival(100.0, 99.0, 0.0), 0.1);
    }
}

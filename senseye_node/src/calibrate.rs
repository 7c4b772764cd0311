//! Calibration drive: acoustic ping/pong exchange and input gathering.
//!
//! The pure layout math lives in `senseye_core::calibration`; this module
//! does the I/O around it. The initiator asks each peer (acoustic ping) to
//! chirp in the peer's own band after a fixed delay, records the room,
//! matched-filters the capture against that band, and turns the arrival
//! time into a one-way range. Every step is bounded by a timeout; a peer
//! that fails simply contributes no acoustic edge.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use senseye_core::acoustic::{self, chirp_band};
use senseye_core::calibration::{CalibrationError, CalibrationInputs, LinkObservation};
use senseye_core::inference::LocalInference;
use senseye_core::propagation::PathLossModel;
use senseye_core::{Belief, FilterBank, PairKey};
use senseye_env::{AcousticDevice, NodeId, SenseContext};

use crate::gossip::{GossipMesh, MeshEvent};
use crate::protocol::WireMessage;

/// Acoustic exchange tunables.
#[derive(Debug, Clone)]
pub struct AcousticExchangeConfig {
    /// Responder chirps this long after receiving the ping, seconds.
    pub delay_s: f64,
    pub sample_rate: u32,
    pub chirp_duration_s: f64,
    /// Recording window; must cover delay plus flight time, seconds.
    pub record_duration_s: f64,
    /// How long to wait for the pong, seconds.
    pub pong_timeout_s: f64,
    /// Matched-filter peak SNR below this rejects the range.
    pub min_snr: f64,
}

impl Default for AcousticExchangeConfig {
    fn default() -> Self {
        Self {
            delay_s: 0.5,
            sample_rate: 48_000,
            chirp_duration_s: 0.05,
            record_duration_s: 1.5,
            pong_timeout_s: 3.0,
            min_snr: 4.0,
        }
    }
}

/// Ranges each reachable peer acoustically, one at a time so the chirps
/// never overlap on our own microphone. Events that are not the awaited
/// pong are pushed to `stash` for the caller to replay.
pub async fn measure_peer_ranges<C: SenseContext, A: AcousticDevice + ?Sized>(
    ctx: &C,
    mesh: &GossipMesh,
    events: &mut mpsc::Receiver<MeshEvent>,
    device: &A,
    peers: &[NodeId],
    config: &AcousticExchangeConfig,
    stash: &mut Vec<MeshEvent>,
) -> Result<BTreeMap<NodeId, f64>, CalibrationError> {
    let mut ranges = BTreeMap::new();

    for peer in peers {
        let band = chirp_band(peer);
        let request_id = Uuid::new_v4().to_string();
        let sent_at_s = ctx.system_time_s();

        let ping = WireMessage::AcousticPing {
            request_id: request_id.clone(),
            delay_s: config.delay_s,
            sample_rate: config.sample_rate,
            freq_start: band.freq_start_hz,
            freq_end: band.freq_end_hz,
            chirp_duration: config.chirp_duration_s,
        };
        if !mesh.send_to(peer, &ping) {
            debug!(peer = %peer, "peer not connected, skipping acoustic range");
            continue;
        }

        // Record over the scheduled chirp window.
        let capture = match device.record(config.record_duration_s).await {
            Ok(capture) => capture,
            Err(error) => {
                warn!(%error, "acoustic capture failed");
                continue;
            }
        };

        // Collect the pong (bounded), stashing unrelated traffic.
        let deadline = ctx.now() + Duration::from_secs_f64(config.pong_timeout_s);
        let mut pong_ok = false;
        loop {
            let remaining = deadline.saturating_sub(ctx.now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Some(MeshEvent::PongReceived {
                    from,
                    request_id: rid,
                    ok,
                    error,
                })) if rid == request_id => {
                    if let Some(error) = error {
                        debug!(peer = %from, %error, "acoustic pong reported failure");
                    }
                    pong_ok = ok;
                    break;
                }
                Ok(Some(other)) => stash.push(other),
                Ok(None) | Err(_) => break,
            }
        }
        if !pong_ok {
            debug!(peer = %peer, "no successful pong, skipping");
            continue;
        }

        let template =
            acoustic::synthesize_chirp(band, config.chirp_duration_s, config.sample_rate);
        let Some(hit) = acoustic::matched_filter(&capture.samples, &template, capture.sample_rate)
        else {
            debug!(peer = %peer, "no correlation peak");
            continue;
        };
        if hit.peak_snr < config.min_snr {
            debug!(peer = %peer, snr = hit.peak_snr, "correlation too weak");
            continue;
        }

        let range_m = acoustic::range_from_arrival(
            sent_at_s + config.delay_s,
            capture.capture_start_s,
            hit.delay_s,
        );
        debug!(peer = %peer, range_m, snr = hit.peak_snr, "acoustic range");
        ranges.insert(peer.clone(), range_m);
    }

    if ranges.is_empty() && !peers.is_empty() {
        return Err(CalibrationError::AcousticFailure(
            "no peer produced a usable chirp".into(),
        ));
    }
    Ok(ranges)
}

/// Assembles the orchestrator inputs from the node's current knowledge:
/// its own filter bank, the latest belief per peer, and whatever acoustic
/// ranges were just measured.
pub fn gather_inputs(
    local: &NodeId,
    bank: &FilterBank,
    inference: &LocalInference,
    beliefs: &BTreeMap<NodeId, Belief>,
    peers: &BTreeSet<NodeId>,
    own_acoustic: &BTreeMap<NodeId, f64>,
    now_s: f64,
) -> CalibrationInputs {
    // Participant set: ourselves first (the reference node), then every
    // peer we have heard from or about.
    let mut others: BTreeSet<NodeId> = peers.clone();
    others.extend(beliefs.keys().cloned());
    others.remove(local);
    let mut nodes = vec![local.clone()];
    nodes.extend(others.iter().cloned());
    let node_set: BTreeSet<NodeId> = nodes.iter().cloned().collect();

    let mut inputs = CalibrationInputs {
        nodes,
        built_at_s: now_s,
        ..CalibrationInputs::default()
    };

    // Wall detection runs against the free-space model so obstructions
    // show as excess attenuation.
    let free_space = PathLossModel::free_space();
    let window = bank.config().window;

    // Our own filtered paths.
    for (key, filter) in bank.iter() {
        if key.source != *local || !key.kind.is_rf() {
            continue;
        }
        if node_set.contains(&key.target) {
            add_link(
                &mut inputs,
                &free_space,
                PairKey::new(local.clone(), key.target.clone()),
                filter.rssi(),
                inference.rf_confidence(filter, window),
            );
        } else {
            inputs
                .baseline_device_rssis
                .insert(key.target.clone(), filter.rssi());
        }
    }

    // What the peers see.
    for (origin, belief) in beliefs {
        for (target, device) in &belief.devices {
            if node_set.contains(target) {
                if node_set.contains(origin) {
                    add_link(
                        &mut inputs,
                        &free_space,
                        PairKey::new(origin.clone(), target.clone()),
                        device.rssi_dbm,
                        device.confidence,
                    );
                }
            } else {
                inputs
                    .baseline_device_rssis
                    .entry(target.clone())
                    .or_insert(device.rssi_dbm);
            }
        }
        if let Some(acoustic_ranges) = &belief.acoustic_ranges {
            for (target, range) in acoustic_ranges {
                if node_set.contains(target) {
                    inputs
                        .acoustic_pairs
                        .entry(PairKey::new(origin.clone(), target.clone()))
                        .or_insert(*range);
                }
            }
        }
    }

    // Our own acoustic ranges win over relayed ones.
    for (peer, range) in own_acoustic {
        inputs
            .acoustic_pairs
            .insert(PairKey::new(local.clone(), peer.clone()), *range);
    }

    inputs
}

/// Records one link observation, keeping the more confident RSSI and the
/// first RF range for the pair.
fn add_link(
    inputs: &mut CalibrationInputs,
    free_space: &PathLossModel,
    pair: PairKey,
    rssi: f64,
    confidence: f64,
) {
    inputs
        .rf_pairs
        .entry(pair.clone())
        .or_insert_with(|| free_space.distance_from_rssi(rssi));
    let keep_existing = inputs
        .links
        .get(&pair)
        .is_some_and(|existing| existing.confidence >= confidence);
    if !keep_existing {
        inputs.links.insert(
            pair,
            LinkObservation {
                rssi_dbm: rssi,
                confidence,
            },
        );
    }
}

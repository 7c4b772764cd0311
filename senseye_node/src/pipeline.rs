//! The node pipeline: SCAN -> FILTER -> INFER -> SHARE <-> FUSE -> WORLD.
//!
//! One cooperative task owns all mutable pipeline state (filter bank,
//! belief table, world). Measurements and mesh events arrive between
//! ticks; each tick runs the full fusion cycle against a consistent
//! snapshot of the held beliefs (arrivals mid-cycle wait for the next
//! one) and publishes an immutable `WorldSnapshot` on a watch channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Point2;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use senseye_core::calibration::{calibrate_layout, CalibrationConfig};
use senseye_core::tomography::{self, LinkSample, TomographyConfig};
use senseye_core::trilateration::{self, Anchor, TrilaterationConfig};
use senseye_core::world::CalibrationStatus;
use senseye_core::{
    Belief, ConsensusFusion, FilterBank, FusedWorld, FusionConfig, InferenceConfig, KalmanConfig,
    LocalInference, NodeHealth, WorldConfig, WorldSnapshot, WorldState,
};
use senseye_env::{AcousticDevice, NodeId, Scanner, SenseContext};

use crate::calibrate::{self, AcousticExchangeConfig};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::gossip::{GossipMesh, MeshEvent};
use crate::protocol::WireMessage;
use crate::store::FloorPlanStore;

/// The running node pipeline.
pub struct NodeRuntime<C: SenseContext> {
    ctx: Arc<C>,
    config: NodeConfig,
    mesh: GossipMesh,
    store: Arc<dyn FloorPlanStore>,

    bank: FilterBank,
    inference: LocalInference,
    fusion: ConsensusFusion,
    world: WorldState,

    /// Latest belief per remote origin.
    beliefs: BTreeMap<NodeId, Belief>,
    /// Beliefs that arrived mid-cycle, held for the next one.
    pending: Vec<Belief>,
    /// Monotone local emission counter.
    sequence: u64,
    /// Acoustic ranges measured since the last emission.
    acoustic_ranges: BTreeMap<NodeId, f64>,
    last_acoustic_s: Option<f64>,
    auto_calibration_due: bool,

    calibration_status: CalibrationStatus,
    calibration_config: CalibrationConfig,
    tomography_config: TomographyConfig,
    trilateration_config: TrilaterationConfig,
    exchange_config: AcousticExchangeConfig,

    snapshot_tx: watch::Sender<WorldSnapshot>,
}

impl<C: SenseContext> NodeRuntime<C> {
    /// Builds the runtime around an already-started mesh, loading any
    /// persisted floorplan. Returns the runtime and the snapshot stream
    /// for the renderer.
    pub fn new(
        ctx: Arc<C>,
        config: NodeConfig,
        mesh: GossipMesh,
        store: Arc<dyn FloorPlanStore>,
    ) -> Result<(Self, watch::Receiver<WorldSnapshot>), NodeError> {
        let floorplan = store.load()?;
        if floorplan.is_some() {
            info!("loaded persisted floorplan");
        }

        let world_config = WorldConfig {
            acoustic_interval_s: config.acoustic.interval_s(),
            ..WorldConfig::default()
        };
        let calibration_status = if floorplan.is_some() {
            CalibrationStatus::Current
        } else {
            CalibrationStatus::None
        };
        let world = WorldState::new(world_config, floorplan);

        let now = ctx.system_time_s();
        let initial = world.snapshot(
            &config.name,
            now,
            NodeHealth::default(),
            calibration_status.clone(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let fusion_config = FusionConfig {
            stale_horizon_s: config.stale_horizon_s,
            ..FusionConfig::default()
        };

        Ok((
            Self {
                ctx,
                config,
                mesh,
                store,
                bank: FilterBank::new(KalmanConfig::default()),
                inference: LocalInference::new(InferenceConfig::default()),
                fusion: ConsensusFusion::new(fusion_config),
                world,
                beliefs: BTreeMap::new(),
                pending: Vec::new(),
                sequence: 0,
                acoustic_ranges: BTreeMap::new(),
                last_acoustic_s: None,
                auto_calibration_due: false,
                calibration_status,
                calibration_config: CalibrationConfig::default(),
                tomography_config: TomographyConfig::default(),
                trilateration_config: TrilaterationConfig::default(),
                exchange_config: AcousticExchangeConfig::default(),
                snapshot_tx,
            },
            snapshot_rx,
        ))
    }

    /// Runs the pipeline until the scanner stream ends.
    pub async fn run<S, A>(
        mut self,
        scanner: S,
        mut events: mpsc::Receiver<MeshEvent>,
        acoustic: Option<Arc<A>>,
    ) where
        S: Scanner,
        A: AcousticDevice,
    {
        let ctx = self.ctx.clone();
        let interval = Duration::from_secs_f64(self.config.pipeline_interval_s);
        let mut next_cycle = ctx.now() + interval;

        loop {
            let mut run_cycle = false;
            let remaining = next_cycle.saturating_sub(ctx.now());
            tokio::select! {
                _ = ctx.sleep(remaining) => {
                    run_cycle = true;
                    next_cycle = ctx.now() + interval;
                }
                measurement = scanner.next_measurement() => match measurement {
                    Some(m) => {
                        self.bank.ingest(&m);
                    }
                    None => {
                        info!("scanner stream ended, stopping pipeline");
                        break;
                    }
                },
                event = events.recv() => if let Some(event) = event {
                    self.on_event(event, acoustic.as_ref());
                },
            }

            if run_cycle {
                self.cycle();
                if self.auto_calibration_due {
                    self.auto_calibration_due = false;
                    if let Some(device) = &acoustic {
                        self.recalibrate(&mut events, device.as_ref()).await;
                    }
                }
            }
        }
    }

    /// One-shot calibration for the `calibrate` subcommand: warm up the
    /// bank and belief table, run the acoustic exchange when a device is
    /// available, lay out the floorplan, persist it.
    pub async fn calibrate_once<S, A>(
        mut self,
        scanner: S,
        mut events: mpsc::Receiver<MeshEvent>,
        acoustic: Option<Arc<A>>,
        warmup_s: f64,
    ) -> Result<senseye_core::FloorPlan, NodeError>
    where
        S: Scanner,
        A: AcousticDevice,
    {
        let ctx = self.ctx.clone();
        info!(warmup_s, "gathering calibration measurements");
        let deadline = ctx.now() + Duration::from_secs_f64(warmup_s);

        loop {
            let remaining = deadline.saturating_sub(ctx.now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = ctx.sleep(remaining) => break,
                measurement = scanner.next_measurement() => match measurement {
                    Some(m) => {
                        self.bank.ingest(&m);
                    }
                    None => break,
                },
                event = events.recv() => if let Some(event) = event {
                    self.on_event(event, acoustic.as_ref());
                },
            }
        }
        self.merge_pending();

        let now = self.ctx.system_time_s();
        let own_ranges = match &acoustic {
            Some(device) => {
                let peers: Vec<NodeId> = self.mesh.peer_ids().into_iter().collect();
                let mut stash = Vec::new();
                let outcome = calibrate::measure_peer_ranges(
                    self.ctx.as_ref(),
                    &self.mesh,
                    &mut events,
                    device.as_ref(),
                    &peers,
                    &self.exchange_config,
                    &mut stash,
                )
                .await;
                self.pending.extend(stash.into_iter().filter_map(|e| match e {
                    MeshEvent::BeliefReceived { belief, .. } => Some(belief),
                    _ => None,
                }));
                self.merge_pending();
                match outcome {
                    Ok(ranges) => ranges,
                    Err(error) => {
                        // Ranging fusion prefers acoustic edges but does
                        // not require them; the RF estimates still feed
                        // the layout.
                        warn!(%error, "acoustic exchange failed, continuing with RF ranging");
                        BTreeMap::new()
                    }
                }
            }
            None => BTreeMap::new(),
        };

        let inputs = calibrate::gather_inputs(
            &self.config.name,
            &self.bank,
            &self.inference,
            &self.beliefs,
            &self.mesh.peer_ids(),
            &own_ranges,
            now,
        );
        let plan = calibrate_layout(&inputs, &self.calibration_config)?;
        self.store.save(&plan)?;
        info!(
            nodes = plan.node_positions.len(),
            rooms = plan.rooms.len(),
            "floorplan calibrated and saved"
        );
        Ok(plan)
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    fn on_event<A: AcousticDevice>(&mut self, event: MeshEvent, acoustic: Option<&Arc<A>>) {
        match event {
            MeshEvent::BeliefReceived { belief, .. } => {
                self.pending.push(belief);
            }
            MeshEvent::PingReceived {
                from,
                request_id,
                delay_s,
                freq_start,
                freq_end,
                chirp_duration,
                ..
            } => {
                self.on_ping(
                    acoustic,
                    from,
                    request_id,
                    delay_s,
                    freq_start,
                    freq_end,
                    chirp_duration,
                );
            }
            MeshEvent::PongReceived { from, .. } => {
                // Pongs outside a calibration exchange carry no state.
                debug!(peer = %from, "stray acoustic pong");
            }
            MeshEvent::PeerUp(peer) => debug!(peer = %peer, "peer up"),
            MeshEvent::PeerDown(peer) => debug!(peer = %peer, "peer down"),
        }
    }

    /// Responds to an acoustic ping: chirp after the requested delay, then
    /// report the outcome.
    #[allow(clippy::too_many_arguments)]
    fn on_ping<A: AcousticDevice>(
        &self,
        acoustic: Option<&Arc<A>>,
        from: NodeId,
        request_id: String,
        delay_s: f64,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    ) {
        let mesh = self.mesh.clone();
        match acoustic {
            Some(device) => {
                let device = Arc::clone(device);
                let ctx = self.ctx.clone();
                self.ctx.spawn("acoustic-pong", async move {
                    ctx.sleep(Duration::from_secs_f64(delay_s.clamp(0.0, 10.0))).await;
                    let played = device.play_chirp(freq_start, freq_end, chirp_duration).await;
                    let (ok, error) = match played {
                        Ok(_) => (true, None),
                        Err(e) => (false, Some(e.to_string())),
                    };
                    mesh.send_to(
                        &from,
                        &WireMessage::AcousticPong {
                            request_id,
                            ok,
                            error,
                        },
                    );
                });
            }
            None => {
                mesh.send_to(
                    &from,
                    &WireMessage::AcousticPong {
                        request_id,
                        ok: false,
                        error: Some("no acoustic device".into()),
                    },
                );
            }
        }
    }

    // ========================================================================
    // THE FUSION CYCLE
    // ========================================================================

    fn merge_pending(&mut self) {
        for belief in self.pending.drain(..) {
            let newer = self
                .beliefs
                .get(&belief.origin)
                .map_or(true, |existing| {
                    existing.sequence_number < belief.sequence_number
                });
            if newer {
                self.beliefs.insert(belief.origin.clone(), belief);
            }
        }
    }

    fn cycle(&mut self) {
        let now = self.ctx.system_time_s();
        self.bank.purge(now);
        self.mesh.expire_dedup(now);
        self.merge_pending();
        // Remote beliefs way past the horizon are dead weight.
        let horizon = self.config.stale_horizon_s;
        self.beliefs.retain(|_, b| !b.is_stale(now, horizon * 3.0));

        // INFER + SHARE
        self.sequence += 1;
        let acoustic_ranges =
            (!self.acoustic_ranges.is_empty()).then(|| std::mem::take(&mut self.acoustic_ranges));
        let local = self.inference.infer(
            &self.bank,
            self.world.floorplan(),
            &self.config.name,
            self.sequence,
            now,
            acoustic_ranges,
        );
        self.mesh.note_own_emission(self.sequence, now);
        self.mesh.broadcast_belief(&local);

        // FUSE over a consistent snapshot: held remote beliefs + our own.
        let mut contributions: Vec<&Belief> = self.beliefs.values().collect();
        contributions.push(&local);
        let fused = self.fusion.fuse(&contributions, now);

        // Position devices and refresh the live attenuation overlay.
        let device_positions = self.locate_devices(&local, &fused);
        let live_attenuation = self.reconstruct_overlay(&fused);
        self.world
            .apply_cycle(&fused, &device_positions, live_attenuation, now);

        // Recalibration policy.
        let current_rssis: BTreeMap<NodeId, f64> = fused
            .devices
            .iter()
            .map(|(id, d)| (id.clone(), d.rssi_dbm))
            .collect();
        let trigger = self.world.recalibration_trigger(
            self.peer_set_changed(),
            self.last_acoustic_s,
            &current_rssis,
            now,
        );
        match trigger {
            Some(trigger) => {
                debug!(%trigger, "recalibration due");
                if self.config.acoustic.interval_s().is_some() {
                    self.auto_calibration_due = true;
                }
                self.calibration_status = CalibrationStatus::Due {
                    reason: trigger.to_string(),
                };
            }
            None => {
                if self.world.floorplan().is_some()
                    && !matches!(self.calibration_status, CalibrationStatus::Failed { .. })
                {
                    self.calibration_status = CalibrationStatus::Current;
                }
            }
        }

        // WORLD -> RENDER
        let snapshot = self.world.snapshot(
            &self.config.name,
            now,
            self.mesh.health(now),
            self.calibration_status.clone(),
        );
        debug!(
            links = fused.links.len(),
            devices = fused.devices.len(),
            zones = fused.zones.len(),
            peers = snapshot.node_health.peers_alive,
            "cycle complete"
        );
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Trilaterates every device that at least three positioned nodes have
    /// ranged this cycle.
    fn locate_devices(
        &self,
        local: &Belief,
        fused: &FusedWorld,
    ) -> BTreeMap<NodeId, Point2<f64>> {
        let mut positions = BTreeMap::new();
        let Some(plan) = self.world.floorplan() else {
            return positions;
        };

        for device in fused.devices.keys() {
            let mut anchors = Vec::new();
            for belief in self.beliefs.values().chain(std::iter::once(local)) {
                let Some(anchor_position) = plan.position_of(&belief.origin) else {
                    continue;
                };
                if let Some(observation) = belief.devices.get(device) {
                    anchors.push(Anchor {
                        position: anchor_position,
                        range_m: observation.estimated_distance_m,
                    });
                }
            }
            match trilateration::solve(&anchors, &self.trilateration_config) {
                Ok(fix) => {
                    positions.insert(device.clone(), fix.position);
                }
                Err(error) => {
                    debug!(device = %device, %error, "no position fix");
                }
            }
        }
        positions
    }

    /// Runs tomography over the fused links when a floorplan grid exists.
    fn reconstruct_overlay(
        &self,
        fused: &FusedWorld,
    ) -> Option<senseye_core::AttenuationField> {
        let plan = self.world.floorplan()?;
        let links: Vec<LinkSample> = fused
            .links
            .iter()
            .filter_map(|(pair, link)| {
                let a = plan.position_of(pair.a())?;
                let b = plan.position_of(pair.b())?;
                (link.attenuation_db > 0.0).then_some(LinkSample {
                    a,
                    b,
                    excess_attenuation_db: link.attenuation_db,
                    confidence: link.confidence,
                })
            })
            .collect();
        if links.is_empty() {
            return None;
        }
        match tomography::reconstruct(&links, &plan.walls.geometry, &self.tomography_config) {
            Ok(field) => Some(field),
            Err(error) => {
                warn!(%error, "tomography solve failed");
                None
            }
        }
    }

    /// True when the mesh membership no longer matches the floorplan.
    fn peer_set_changed(&self) -> bool {
        let Some(plan) = self.world.floorplan() else {
            return false;
        };
        let mut current: BTreeSet<NodeId> = self.mesh.peer_ids();
        current.insert(self.config.name.clone());
        let planned: BTreeSet<NodeId> = plan.node_positions.keys().cloned().collect();
        current != planned
    }

    /// Scheduled acoustic recalibration from inside the pipeline.
    async fn recalibrate<A: AcousticDevice + ?Sized>(
        &mut self,
        events: &mut mpsc::Receiver<MeshEvent>,
        device: &A,
    ) {
        let now = self.ctx.system_time_s();
        let peers: Vec<NodeId> = self.mesh.peer_ids().into_iter().collect();
        let mut stash = Vec::new();
        let outcome = calibrate::measure_peer_ranges(
            self.ctx.as_ref(),
            &self.mesh,
            events,
            device,
            &peers,
            &self.exchange_config,
            &mut stash,
        )
        .await;
        self.pending.extend(stash.into_iter().filter_map(|e| match e {
            MeshEvent::BeliefReceived { belief, .. } => Some(belief),
            _ => None,
        }));

        let ranges = match outcome {
            Ok(ranges) => ranges,
            Err(error) => {
                warn!(%error, "acoustic exchange failed");
                self.calibration_status = CalibrationStatus::Failed {
                    error: error.to_string(),
                };
                return;
            }
        };
        self.last_acoustic_s = Some(now);
        self.acoustic_ranges.extend(ranges.clone());

        let inputs = calibrate::gather_inputs(
            &self.config.name,
            &self.bank,
            &self.inference,
            &self.beliefs,
            &self.mesh.peer_ids(),
            &ranges,
            now,
        );
        match calibrate_layout(&inputs, &self.calibration_config) {
            Ok(plan) => {
                if let Err(error) = self.store.save(&plan) {
                    warn!(%error, "failed to persist floorplan");
                }
                self.world.set_floorplan(plan);
                self.calibration_status = CalibrationStatus::Current;
                info!("recalibration complete");
            }
            Err(error) => {
                warn!(%error, "recalibration failed, keeping prior floorplan");
                self.calibration_status = CalibrationStatus::Failed {
                    error: error.to_string(),
                };
            }
        }
    }
}

//! Gossip mesh: TCP peer fabric relaying beliefs with dedup and hop TTL.
//!
//! One connection task per discovered peer, reconnecting with capped
//! exponential backoff; newline-delimited JSON frames; a shared
//! [`BeliefRouter`] decides, per incoming belief, whether to deliver it to
//! the pipeline and whether to relay it onward. Socket errors trigger
//! reconnect and never invalidate state; malformed frames increment a
//! counter and are dropped; oversized frames abort the connection.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use senseye_core::{Belief, NodeHealth};
use senseye_env::{NodeId, PeerEvent, Role, ServiceRegistry};

use crate::dedup::{DedupOutcome, DedupTable};
use crate::error::NodeError;
use crate::protocol::{self, DecodeOutcome, WireMessage};

/// Mesh tunables.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// TCP listen port (0 picks an ephemeral port).
    pub port: u16,

    /// Frames beyond this many bytes abort the connection.
    pub max_frame_bytes: usize,

    /// Connect timeout, seconds.
    pub connect_timeout_s: f64,

    /// Read timeout; a peer silent this long is disconnected, seconds.
    pub read_timeout_s: f64,

    /// Reconnect backoff base and cap, seconds.
    pub backoff_base_s: f64,
    pub backoff_cap_s: f64,

    /// A peer whose last belief is older than this is excluded from the
    /// alive count, seconds.
    pub peer_stale_s: f64,

    /// Dedup table capacity and entry lifetime.
    pub dedup_capacity: usize,
    pub dedup_max_age_s: f64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            port: protocol::DEFAULT_PORT,
            max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES,
            connect_timeout_s: 5.0,
            read_timeout_s: 30.0,
            backoff_base_s: 0.5,
            backoff_cap_s: 30.0,
            peer_stale_s: 10.0,
            dedup_capacity: 4096,
            dedup_max_age_s: 120.0,
        }
    }
}

/// Events the mesh hands to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    BeliefReceived {
        from: NodeId,
        belief: Belief,
    },
    PingReceived {
        from: NodeId,
        request_id: String,
        delay_s: f64,
        sample_rate: u32,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    },
    PongReceived {
        from: NodeId,
        request_id: String,
        ok: bool,
        error: Option<String>,
    },
    PeerUp(NodeId),
    PeerDown(NodeId),
}

// ============================================================================
// BELIEF ROUTER (pure, synchronously testable)
// ============================================================================

/// What to do with one received belief.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Deliver to fusion; `forward` carries the hop-decremented relay copy
    /// when the TTL allows one.
    Deliver {
        belief: Belief,
        forward: Option<Belief>,
    },
    /// `(origin, seq)` already seen; drop silently.
    Duplicate,
    /// Below the highest sequence seen from this origin; drop.
    StaleSequence,
    /// Our own belief echoed back through the mesh; drop.
    OwnOrigin,
}

/// The dedup-and-relay decision core of the mesh.
#[derive(Debug)]
pub struct BeliefRouter {
    local: NodeId,
    dedup: DedupTable,
}

impl BeliefRouter {
    pub fn new(local: NodeId, dedup_capacity: usize) -> Self {
        Self {
            local,
            dedup: DedupTable::new(dedup_capacity),
        }
    }

    /// Records our own emission so mesh echoes of it are dropped.
    pub fn note_own_emission(&mut self, seq: u64, now_s: f64) {
        let local = self.local.clone();
        let _ = self.dedup.offer(&local, seq, now_s);
    }

    /// Routes one received belief.
    pub fn route(&mut self, belief: Belief, now_s: f64) -> RouteDecision {
        if belief.origin == self.local {
            return RouteDecision::OwnOrigin;
        }
        match self.dedup.offer(&belief.origin, belief.sequence_number, now_s) {
            DedupOutcome::Duplicate => RouteDecision::Duplicate,
            DedupOutcome::StaleSequence => RouteDecision::StaleSequence,
            DedupOutcome::Fresh => {
                let forward = belief.relayed();
                RouteDecision::Deliver { belief, forward }
            }
        }
    }

    pub fn expire(&mut self, now_s: f64, max_age_s: f64) {
        self.dedup.expire(now_s, max_age_s);
    }
}

// ============================================================================
// MESH
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    malformed: AtomicU64,
    oversize: AtomicU64,
    duplicates: AtomicU64,
    relayed: AtomicU64,
}

struct PeerState {
    tx: mpsc::Sender<String>,
    last_belief_s: f64,
}

struct MeshInner {
    local: NodeId,
    role: Role,
    position: Option<[f64; 2]>,
    config: GossipConfig,
    peers: Mutex<HashMap<NodeId, PeerState>>,
    router: Mutex<BeliefRouter>,
    events: mpsc::Sender<MeshEvent>,
    counters: Counters,
    connectors: Mutex<HashMap<NodeId, JoinHandle<()>>>,
}

/// Handle to the running mesh.
#[derive(Clone)]
pub struct GossipMesh {
    inner: Arc<MeshInner>,
}

fn wall_clock_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl GossipMesh {
    /// Binds the listener, starts discovery, and returns the mesh handle,
    /// the event stream for the pipeline, and the bound address.
    pub async fn start<R: ServiceRegistry>(
        config: GossipConfig,
        local: NodeId,
        role: Role,
        position: Option<[f64; 2]>,
        registry: R,
    ) -> Result<(Self, mpsc::Receiver<MeshEvent>, SocketAddr), NodeError> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let bound = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let inner = Arc::new(MeshInner {
            router: Mutex::new(BeliefRouter::new(local.clone(), config.dedup_capacity)),
            local: local.clone(),
            role,
            position,
            config,
            peers: Mutex::new(HashMap::new()),
            events: events_tx,
            counters: Counters::default(),
            connectors: Mutex::new(HashMap::new()),
        });

        registry
            .announce(&local, bound.port(), role, position)
            .await?;

        // Accept loop for inbound peers.
        let accept_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound gossip connection");
                        let conn_inner = accept_inner.clone();
                        tokio::spawn(async move {
                            let _ = run_connection(conn_inner, stream).await;
                        });
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Discovery loop: one connector task per joined peer.
        let registry_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = registry.next_event().await {
                match event {
                    PeerEvent::Joined { node, addr, .. } => {
                        info!(peer = %node, %addr, "peer discovered");
                        let connect_inner = registry_inner.clone();
                        let handle = tokio::spawn(async move {
                            maintain_peer(connect_inner, addr).await;
                        });
                        if let Some(old) =
                            registry_inner.connectors.lock().unwrap().insert(node, handle)
                        {
                            old.abort();
                        }
                    }
                    PeerEvent::Left { node } => {
                        info!(peer = %node, "peer left");
                        if let Some(handle) =
                            registry_inner.connectors.lock().unwrap().remove(&node)
                        {
                            handle.abort();
                        }
                        registry_inner.peers.lock().unwrap().remove(&node);
                        let _ = registry_inner.events.send(MeshEvent::PeerDown(node)).await;
                    }
                }
            }
        });

        Ok((Self { inner }, events_rx, bound))
    }

    /// Records our own emission in the dedup table.
    pub fn note_own_emission(&self, seq: u64, now_s: f64) {
        self.inner
            .router
            .lock()
            .unwrap()
            .note_own_emission(seq, now_s);
    }

    /// Broadcasts a belief frame to every connected peer.
    pub fn broadcast_belief(&self, belief: &Belief) {
        let Ok(frame) = protocol::encode(&WireMessage::Belief(Box::new(belief.clone()))) else {
            return;
        };
        let peers = self.inner.peers.lock().unwrap();
        for (peer, state) in peers.iter() {
            if state.tx.try_send(frame.clone()).is_err() {
                debug!(peer = %peer, "send queue full, dropping frame");
            }
        }
    }

    /// Sends one message to one peer. Returns false when the peer is not
    /// connected or its queue is full.
    pub fn send_to(&self, peer: &NodeId, message: &WireMessage) -> bool {
        let Ok(frame) = protocol::encode(message) else {
            return false;
        };
        let peers = self.inner.peers.lock().unwrap();
        peers
            .get(peer)
            .map(|state| state.tx.try_send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Ids of all currently connected peers.
    pub fn peer_ids(&self) -> BTreeSet<NodeId> {
        self.inner.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Sweeps the dedup table.
    pub fn expire_dedup(&self, now_s: f64) {
        let max_age = self.inner.config.dedup_max_age_s;
        self.inner.router.lock().unwrap().expire(now_s, max_age);
    }

    /// Health counters for the snapshot.
    pub fn health(&self, now_s: f64) -> NodeHealth {
        let peers = self.inner.peers.lock().unwrap();
        let stale = self.inner.config.peer_stale_s;
        NodeHealth {
            peers_known: peers.len(),
            peers_alive: peers
                .values()
                .filter(|p| now_s - p.last_belief_s <= stale)
                .count(),
            malformed_frames: self.inner.counters.malformed.load(Ordering::Relaxed),
            oversize_frames: self.inner.counters.oversize.load(Ordering::Relaxed),
            duplicate_beliefs: self.inner.counters.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Keeps one outbound peer connection alive with capped, jittered
/// exponential backoff.
async fn maintain_peer(inner: Arc<MeshInner>, addr: SocketAddr) {
    let mut backoff = inner.config.backoff_base_s;
    loop {
        let connect = tokio::time::timeout(
            Duration::from_secs_f64(inner.config.connect_timeout_s),
            TcpStream::connect(addr),
        )
        .await;
        match connect {
            Ok(Ok(stream)) => {
                backoff = inner.config.backoff_base_s;
                if let Err(error) = run_connection(inner.clone(), stream).await {
                    debug!(%addr, %error, "gossip connection closed");
                }
            }
            Ok(Err(error)) => debug!(%addr, %error, "connect failed"),
            Err(_) => debug!(%addr, "connect timed out"),
        }

        let jitter = rand::thread_rng().gen_range(0.0..backoff * 0.25 + 1e-3);
        tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
        backoff = (backoff * 2.0).min(inner.config.backoff_cap_s);
    }
}

/// Drives one established connection until EOF, error, read timeout, or an
/// oversized frame.
async fn run_connection(inner: Arc<MeshInner>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    let announce = protocol::encode(&WireMessage::Announce {
        node_id: inner.local.clone(),
        role: inner.role,
        position: inner.position,
    })
    .map_err(std::io::Error::other)?;
    write_half.write_all(announce.as_bytes()).await?;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();
    let mut peer_id: Option<NodeId> = None;
    let read_timeout = Duration::from_secs_f64(inner.config.read_timeout_s);
    let max_frame = inner.config.max_frame_bytes;

    let result: std::io::Result<()> = loop {
        let read = tokio::time::timeout(read_timeout, read_frame(&mut reader, &mut frame, max_frame)).await;
        let got_line = match read {
            Ok(Ok(got)) => got,
            Ok(Err(error)) => {
                if error.kind() == std::io::ErrorKind::InvalidData {
                    inner.counters.oversize.fetch_add(1, Ordering::Relaxed);
                }
                break Err(error);
            }
            Err(_) => break Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout")),
        };
        if !got_line {
            break Ok(());
        }
        let line = String::from_utf8_lossy(&frame);

        match protocol::decode(line.trim_end()) {
            DecodeOutcome::Message(message) => {
                handle_message(&inner, &tx, &mut peer_id, message).await;
            }
            DecodeOutcome::UnknownType => {
                // Additive protocol evolution: newer peers may send more.
            }
            DecodeOutcome::Malformed => {
                inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    writer.abort();
    if let Some(peer) = peer_id {
        let removed = {
            let mut peers = inner.peers.lock().unwrap();
            // Only drop the registry entry if it still refers to this
            // connection (a reconnect may already have replaced it).
            if peers.get(&peer).is_some_and(|state| state.tx.is_closed()) {
                peers.remove(&peer);
                true
            } else {
                false
            }
        };
        if removed {
            let _ = inner.events.send(MeshEvent::PeerDown(peer)).await;
        }
    }
    result
}

/// Reads one newline-terminated frame into `buf` (newline excluded),
/// without ever buffering more than `max` bytes of one frame. Returns
/// `Ok(false)` on a clean EOF and `InvalidData` on an oversized frame.
async fn read_frame(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<bool> {
    use tokio::io::AsyncBufReadExt as _;
    buf.clear();
    loop {
        let (consumed, complete, eof) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                (0, false, true)
            } else if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                buf.extend_from_slice(&available[..pos]);
                (pos + 1, true, false)
            } else {
                buf.extend_from_slice(available);
                (available.len(), false, false)
            }
        };
        reader.consume(consumed);
        if eof {
            return if buf.is_empty() {
                Ok(false)
            } else {
                // Trailing partial line at EOF: hand it up as a frame.
                Ok(true)
            };
        }
        if buf.len() > max {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized frame",
            ));
        }
        if complete {
            return Ok(true);
        }
    }
}

/// Dispatches one decoded frame.
async fn handle_message(
    inner: &Arc<MeshInner>,
    tx: &mpsc::Sender<String>,
    peer_id: &mut Option<NodeId>,
    message: WireMessage,
) {
    let now_s = wall_clock_s();
    match message {
        WireMessage::Announce { node_id, .. } => {
            debug!(peer = %node_id, "peer announced");
            let fresh = {
                let mut peers = inner.peers.lock().unwrap();
                peers
                    .insert(
                        node_id.clone(),
                        PeerState {
                            tx: tx.clone(),
                            last_belief_s: now_s,
                        },
                    )
                    .is_none()
            };
            *peer_id = Some(node_id.clone());
            if fresh {
                let _ = inner.events.send(MeshEvent::PeerUp(node_id)).await;
            }
        }

        WireMessage::Belief(belief) => {
            let sender = peer_id.clone().unwrap_or_else(|| belief.origin.clone());
            if let Some(peer) = peer_id {
                if let Some(state) = inner.peers.lock().unwrap().get_mut(peer) {
                    state.last_belief_s = now_s;
                }
            }

            let decision = inner.router.lock().unwrap().route(*belief, now_s);
            match decision {
                RouteDecision::Deliver { belief, forward } => {
                    if let Some(relay) = forward {
                        relay_to_others(inner, &sender, &relay);
                    }
                    let _ = inner
                        .events
                        .send(MeshEvent::BeliefReceived {
                            from: sender,
                            belief,
                        })
                        .await;
                }
                RouteDecision::Duplicate | RouteDecision::StaleSequence => {
                    inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                RouteDecision::OwnOrigin => {}
            }
        }

        WireMessage::AcousticPing {
            request_id,
            delay_s,
            sample_rate,
            freq_start,
            freq_end,
            chirp_duration,
        } => {
            if let Some(from) = peer_id.clone() {
                let _ = inner
                    .events
                    .send(MeshEvent::PingReceived {
                        from,
                        request_id,
                        delay_s,
                        sample_rate,
                        freq_start,
                        freq_end,
                        chirp_duration,
                    })
                    .await;
            }
        }

        WireMessage::AcousticPong {
            request_id,
            ok,
            error,
        } => {
            if let Some(from) = peer_id.clone() {
                let _ = inner
                    .events
                    .send(MeshEvent::PongReceived {
                        from,
                        request_id,
                        ok,
                        error,
                    })
                    .await;
            }
        }
    }
}

/// Forwards a relay copy to every peer except the sender.
fn relay_to_others(inner: &Arc<MeshInner>, sender: &NodeId, relay: &Belief) {
    let Ok(frame) = protocol::encode(&WireMessage::Belief(Box::new(relay.clone()))) else {
        return;
    };
    let peers = inner.peers.lock().unwrap();
    let mut relayed = 0u64;
    for (peer, state) in peers.iter() {
        if peer == sender {
            continue;
        }
        if state.tx.try_send(frame.clone()).is_ok() {
            relayed += 1;
        }
    }
    if relayed > 0 {
        inner.counters.relayed.fetch_add(relayed, Ordering::Relaxed);
    }
}

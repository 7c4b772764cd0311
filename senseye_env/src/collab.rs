//! Collaborator traits: signal acquisition and peer discovery.
//!
//! Platform-specific scan utilities (iw/airport wrappers, BLE stacks, audio
//! backends, mDNS daemons) live outside this workspace. They feed the node
//! through these traits.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::EnvError;
use crate::types::{Measurement, NodeId, PcmCapture, PeerEvent, Role};

/// A lazy, infinite stream of measurements.
///
/// Implementations must yield per-path monotonically non-decreasing
/// timestamps; the filter bank discards anything older than the last sample
/// it applied for that path.
#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    /// Returns the next measurement, or `None` on shutdown.
    async fn next_measurement(&self) -> Option<Measurement>;
}

/// Speaker/microphone pair used for ultrasonic ranging.
#[async_trait]
pub trait AcousticDevice: Send + Sync + 'static {
    /// Plays a linear chirp and returns the wall-clock transmit-start time.
    async fn play_chirp(
        &self,
        freq_start_hz: f64,
        freq_end_hz: f64,
        duration_s: f64,
    ) -> Result<f64, EnvError>;

    /// Records for `duration_s` and returns the capture.
    async fn record(&self, duration_s: f64) -> Result<PcmCapture, EnvError>;
}

/// Service discovery: publishes this node and browses for peers.
///
/// The production collaborator wraps mDNS (`_senseye._tcp.local.`); the
/// bundled [`StaticRegistry`] serves an operator-supplied peer list instead.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Publishes this node's service record.
    async fn announce(
        &self,
        node: &NodeId,
        port: u16,
        role: Role,
        position: Option<[f64; 2]>,
    ) -> Result<(), EnvError>;

    /// Returns the next join/leave event, or `None` when browsing ends.
    async fn next_event(&self) -> Option<PeerEvent>;
}

// ============================================================================
// CHANNEL-BACKED IMPLEMENTATIONS
// ============================================================================

/// Channel-backed [`Scanner`].
///
/// The integration point for platform scan collaborators: they hold a
/// [`ScannerHandle`] and push measurements; the pipeline consumes the other
/// end. Also the scanner used by tests.
pub struct ChannelScanner {
    rx: Arc<Mutex<mpsc::Receiver<Measurement>>>,
}

/// Producer half of a [`ChannelScanner`].
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<Measurement>,
}

impl ScannerHandle {
    /// Pushes a measurement into the pipeline. Returns false if the scanner
    /// side has shut down.
    pub async fn push(&self, measurement: Measurement) -> bool {
        self.tx.send(measurement).await.is_ok()
    }
}

impl ChannelScanner {
    /// Creates a scanner and its producer handle with the given buffer depth.
    pub fn new(buffer: usize) -> (Self, ScannerHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
            ScannerHandle { tx },
        )
    }

    /// A scanner that never yields. Used when no platform scan collaborator
    /// is wired in; the node still fuses peer beliefs.
    pub fn idle() -> (Self, ScannerHandle) {
        Self::new(1)
    }
}

#[async_trait]
impl Scanner for ChannelScanner {
    async fn next_measurement(&self) -> Option<Measurement> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

/// Placeholder [`AcousticDevice`] for nodes without a platform audio
/// collaborator: every operation reports failure, so acoustic ranging
/// degrades to the RF path.
pub struct NullAcousticDevice;

#[async_trait]
impl AcousticDevice for NullAcousticDevice {
    async fn play_chirp(
        &self,
        _freq_start_hz: f64,
        _freq_end_hz: f64,
        _duration_s: f64,
    ) -> Result<f64, EnvError> {
        Err(EnvError::acoustic("no audio collaborator wired"))
    }

    async fn record(&self, _duration_s: f64) -> Result<PcmCapture, EnvError> {
        Err(EnvError::acoustic("no audio collaborator wired"))
    }
}

/// Registry serving a fixed peer list.
///
/// Yields one `Joined` event per configured peer, then reports the browse
/// stream as ended. Peer names default to the address until the peer's
/// `announce` frame arrives over the mesh.
pub struct StaticRegistry {
    pending: Mutex<Vec<PeerEvent>>,
}

impl StaticRegistry {
    /// Creates a registry from configured peer addresses.
    pub fn new(peers: &[SocketAddr]) -> Self {
        let pending = peers
            .iter()
            .rev()
            .map(|addr| PeerEvent::Joined {
                node: NodeId::new(addr.to_string()),
                addr: *addr,
                role: Role::Fixed,
                position: None,
            })
            .collect();
        Self {
            pending: Mutex::new(pending),
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn announce(
        &self,
        _node: &NodeId,
        _port: u16,
        _role: Role,
        _position: Option<[f64; 2]>,
    ) -> Result<(), EnvError> {
        // Nothing to publish; the peer list is operator-managed.
        Ok(())
    }

    async fn next_event(&self) -> Option<PeerEvent> {
        self.pending.lock().await.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;

    #[tokio::test]
    async fn channel_scanner_delivers_in_order() {
        let (scanner, handle) = ChannelScanner::new(4);
        for i in 0..3 {
            handle
                .push(Measurement {
                    source: NodeId::new("a"),
                    target: NodeId::new("b"),
                    kind: SignalKind::Wifi,
                    timestamp_s: i as f64,
                    value: -50.0 - i as f64,
                    snr: None,
                })
                .await;
        }
        drop(handle);

        let mut seen = Vec::new();
        while let Some(m) = scanner.next_measurement().await {
            seen.push(m.timestamp_s);
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn null_acoustic_device_fails_every_operation() {
        let device = NullAcousticDevice;
        assert!(matches!(
            device.play_chirp(17_000.0, 18_000.0, 0.05).await,
            Err(EnvError::AcousticDevice(_))
        ));
        assert!(matches!(
            device.record(1.0).await,
            Err(EnvError::AcousticDevice(_))
        ));
    }

    #[tokio::test]
    async fn static_registry_yields_each_peer_once() {
        let addrs: Vec<SocketAddr> = vec![
            "10.0.0.1:5483".parse().unwrap(),
            "10.0.0.2:5483".parse().unwrap(),
        ];
        let registry = StaticRegistry::new(&addrs);

        let mut joined = Vec::new();
        while let Some(PeerEvent::Joined { addr, .. }) = registry.next_event().await {
            joined.push(addr);
        }
        assert_eq!(joined, addrs);
    }
}

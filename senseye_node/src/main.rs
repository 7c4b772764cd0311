//! Senseye agent CLI.
//!
//! Default invocation runs the sensing pipeline and publishes world
//! snapshots (the terminal dashboard collaborator subscribes to them; with
//! `--headless` the node only logs). `senseye calibrate` runs the
//! calibration orchestrator once and exits.
//!
//! Exit codes: 0 normal, 1 configuration or I/O error, 2 calibration
//! failed.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use senseye_env::{
    ChannelScanner, NodeId, NullAcousticDevice, Role, SenseContext, StaticRegistry, TokioContext,
};
use senseye_node::{
    config::{AcousticMode, NodeConfig},
    gossip::{GossipConfig, GossipMesh},
    pipeline::NodeRuntime,
    store::JsonFloorPlanStore,
    NodeError,
};

/// Distributed indoor sensing agent.
#[derive(Parser, Debug)]
#[command(name = "senseye")]
#[command(about = "Distributed indoor sensing with a shared live floorplan", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Node name; defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Whether this node is installed at a fixed position.
    #[arg(long, value_parser = parse_role, default_value = "fixed")]
    role: Role,

    /// Gossip TCP port.
    #[arg(long, default_value_t = senseye_node::DEFAULT_PORT)]
    port: u16,

    /// Static peer address (repeatable) used when no mDNS collaborator is
    /// running.
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Run without the dashboard renderer.
    #[arg(long)]
    headless: bool,

    /// Acoustic calibration mode: off, on-demand, 10m, 1h.
    #[arg(long, default_value = "on-demand")]
    acoustic: String,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run calibration once, save the floorplan, and exit.
    Calibrate {
        /// Seconds to gather measurements before solving.
        #[arg(long, default_value_t = 10.0)]
        warmup: f64,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s {
        "fixed" => Ok(Role::Fixed),
        "mobile" => Ok(Role::Mobile),
        other => Err(format!("unknown role {other:?} (expected fixed or mobile)")),
    }
}

fn build_config(cli: &Cli) -> Result<NodeConfig, NodeError> {
    let acoustic: AcousticMode = cli
        .acoustic
        .parse()
        .map_err(NodeError::Config)?;
    let name = match &cli.name {
        Some(name) => NodeId::new(name.as_str()),
        None => NodeId::new(
            std::env::var("HOSTNAME").unwrap_or_else(|_| "senseye".to_string()),
        ),
    };
    let config = NodeConfig {
        name,
        role: cli.role,
        port: cli.port,
        peers: cli.peers.clone(),
        headless: cli.headless,
        acoustic,
        ..NodeConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(error) => {
            error!(%error, "fatal");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: NodeConfig) -> Result<ExitCode, NodeError> {
    let ctx = TokioContext::shared();

    let gossip_config = GossipConfig {
        port: config.port,
        max_frame_bytes: config.max_frame_bytes,
        peer_stale_s: config.stale_horizon_s,
        ..GossipConfig::default()
    };
    let registry = StaticRegistry::new(&config.peers);
    let (mesh, events, bound) = GossipMesh::start(
        gossip_config,
        config.name.clone(),
        config.role,
        None,
        registry,
    )
    .await?;
    info!(node = %config.name, addr = %bound, peers = config.peers.len(), "gossip mesh up");

    let store = Arc::new(JsonFloorPlanStore::at_default_path());
    let (runtime, mut snapshots) = NodeRuntime::new(ctx.clone(), config.clone(), mesh, store)?;

    // Platform scan collaborators push into this handle; without one the
    // node still relays and fuses peer beliefs.
    let (scanner, _scan_handle) = ChannelScanner::idle();
    // The audio collaborator is external as well; the null device answers
    // every ping with a failure pong and ranging degrades to RF.
    let acoustic = Some(Arc::new(NullAcousticDevice));

    if let Some(Command::Calibrate { warmup }) = cli.command {
        return match runtime.calibrate_once(scanner, events, acoustic, warmup).await {
            Ok(plan) => {
                info!(
                    nodes = plan.node_positions.len(),
                    rooms = plan.rooms.len(),
                    "calibration complete"
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(NodeError::Calibration(error)) => {
                error!(%error, "calibration failed");
                Ok(ExitCode::from(2))
            }
            Err(other) => Err(other),
        };
    }

    // Snapshot consumer: the renderer in UI mode, the log in headless mode.
    let headless = config.headless;
    ctx.spawn("snapshot-log", async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow().clone();
            if headless {
                info!(
                    zones = snapshot.zones.len(),
                    devices = snapshot.devices.len(),
                    peers_alive = snapshot.node_health.peers_alive,
                    map_age_s = snapshot.map_age_s.map(|a| a.round()),
                    "world"
                );
            }
        }
    });

    let pipeline = tokio::spawn(runtime.run(scanner, events, acoustic));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        _ = pipeline => {}
    }
    Ok(ExitCode::SUCCESS)
}

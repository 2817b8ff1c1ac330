//! lockstep - loopback cluster demo
//!
//! Loads a cluster description (the config argument, the default config
//! path, or the built-in two node demo), simulates every node on an
//! in-process loopback network and runs frames in lock-step.

use anyhow::Context;
use clap::Parser;
use lockstep::{
    config::{default_config_path, ClusterConfig},
    execution::{ExecutionRuntime, ExecutionUnit, UnitTracker},
    net::{ClientBehavior, LoopbackNetwork},
    ClusterCoordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run a cluster of simulated nodes in lock-step
#[derive(Parser, Debug)]
#[command(
    name = "lockstep",
    about = "Run a cluster of simulated render nodes in lock-step",
    version
)]
struct Args {
    /// Cluster description (TOML)
    config: Option<PathBuf>,

    /// Number of frames to run
    #[arg(default_value_t = 10)]
    frames: u32,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ClusterConfig> {
    if let Some(path) = path {
        tracing::info!("Loading cluster from {:?}", path);
        return ClusterConfig::load(&path).with_context(|| format!("loading {:?}", path));
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            tracing::info!("Loading cluster from {:?}", path);
            ClusterConfig::load(&path).with_context(|| format!("loading {:?}", path))
        }
        _ => {
            tracing::info!("No cluster config found, using the loopback demo");
            Ok(ClusterConfig::loopback_demo())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lockstep=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting lockstep");

    let config = load_config(args.config)?;
    let frames = args.frames;

    // Every configured host answers on the loopback network
    let network = LoopbackNetwork::new();
    for node in &config.nodes {
        for connection in &node.connections {
            network.add_host(
                connection.hostname.clone(),
                ClientBehavior {
                    frame_delay: Duration::from_millis(2),
                    ..Default::default()
                },
            );
        }
    }

    let runtime = ExecutionRuntime::new();
    let tracker = UnitTracker::new();
    runtime.add_listener(tracker.clone());

    let mut cluster = ClusterCoordinator::new(
        config,
        Arc::new(network.clone()),
        Arc::new(network.clone()),
        runtime.clone(),
    )?;

    cluster.start_nodes().context("starting nodes")?;
    cluster.init(1).context("initializing cluster")?;
    tracing::info!("{} execution units alive", tracker.live_count());

    let participants = cluster.nodes().count() as u32;
    for frame_id in 1..=frames {
        let frame = cluster.start_frame(frame_id)?;

        // One worker per node meets the others at the frame barrier
        let barrier = cluster.frame_barrier(participants)?;
        let workers: Vec<ExecutionUnit<lockstep::Result<()>>> = cluster
            .nodes()
            .map(|node| ExecutionUnit::new(format!("draw-{}", node.name()), runtime.clone()))
            .collect();
        for worker in &workers {
            let barrier = barrier.clone();
            worker.start(move |_| barrier.arrive())?;
        }
        for worker in &workers {
            worker
                .join(Some(Duration::from_secs(5)))?
                .with_context(|| format!("{} at frame {}", worker.name(), frame))?;
        }
        cluster.release_frame_barrier(barrier)?;

        cluster.finish_frame(frame)?;
        tracing::debug!("Frame {} done", frame);
    }

    for snapshot in cluster.snapshots() {
        tracing::info!("{}", serde_json::to_string(&snapshot)?);
    }

    tracing::info!("Shutting down...");
    cluster.exit()?;
    tracing::info!("{} execution units alive", tracker.live_count());

    Ok(())
}

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use keel_core::memory::MemoryCluster;
use keel_core::ClusterApi;
use keel_engine::{AgentConfig, EngineError, ReconciliationEngine};
use keel_kubehub::KubeCluster;
use keel_transport::TcpConnector;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keeld", version, about = "Keel reconciliation agent")]
struct Cli {
    /// YAML configuration file
    #[arg(short = 'c', long = "config", env = "KEEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Control-plane address (host:port), overrides the config file
    #[arg(long = "control-plane", env = "KEEL_CONTROL_PLANE", global = true)]
    control_plane: Option<String>,

    /// Cluster id announced to the control plane
    #[arg(long = "cluster", env = "KEEL_CLUSTER_ID", global = true)]
    cluster: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the control plane and reconcile until stopped (default)
    Run {
        /// Reconcile against an in-memory cluster instead of the kube API
        #[arg(long = "in-memory", action = ArgAction::SetTrue)]
        in_memory: bool,
    },
    /// Validate the effective configuration and print it as JSON
    CheckConfig,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn effective_config(cli: &Cli) -> Result<AgentConfig> {
    let mut cfg = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(addr) = &cli.control_plane { cfg.control_plane.address = addr.clone(); }
    if let Some(id) = &cli.cluster { cfg.cluster_id = Some(id.clone()); }
    let cfg = cfg.with_env(|k| std::env::var(k).ok()).resolve_identity();
    cfg.validate()?;
    Ok(cfg)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("stop signal received");
}

async fn run(cfg: AgentConfig, in_memory: bool) -> Result<()> {
    let api: Arc<dyn ClusterApi> = if in_memory {
        warn!("using an in-memory cluster; nothing is applied to a real cluster");
        Arc::new(MemoryCluster::new()) as Arc<dyn ClusterApi>
    } else {
        let kube = KubeCluster::connect(cfg.cluster_filters()).await.context("connecting to the cluster")?;
        Arc::new(kube) as Arc<dyn ClusterApi>
    };
    info!(
        cluster = cfg.cluster_id.as_deref().unwrap_or_default(),
        control_plane = %cfg.control_plane.address,
        workers = cfg.scheduler.workers,
        "starting keeld"
    );
    let engine = ReconciliationEngine::from_config(api, Arc::new(TcpConnector::default()), &cfg);
    match engine.run(shutdown_signal()).await {
        Ok(()) => Ok(()),
        Err(e @ EngineError::TransportExhausted { .. }) => {
            error!(error = %e, "giving up");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = effective_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run { in_memory: false }) {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
        Commands::Run { in_memory } => run(cfg, in_memory).await,
    }
}

//! wantun Daemon
//!
//! Supervises one reverse-tunnel cycle: reconcile stale state from a
//! previous run, compute the routing exclusions, run the tunnel client to
//! completion, then reconcile again so no tunnel state survives the
//! cycle. The service manager owns the restart policy.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use wantun_core::TunnelConfig;
use wantun_core::config::{DEFAULT_CONFIG_PATH, DEFAULT_NODE_ID_PATH};
use wantun_daemon::exclusions::{self, UPLINK_INTERFACES};
use wantun_daemon::notify::SystemdNotifier;
use wantun_daemon::reconcile::Reconciler;
use wantun_daemon::supervisor::TunnelSupervisor;

#[derive(Parser, Debug)]
#[command(name = "wantun-daemon")]
#[command(version, about = "Reverse WAN tunnel supervisor")]
struct Args {
    /// Raise log verbosity and pass --verbose to the tunnel client
    #[arg(long)]
    debug: bool,

    /// Tunnel configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, env = "WANTUN_CONFIG")]
    config: PathBuf,

    /// File holding this node's identity
    #[arg(long, default_value = DEFAULT_NODE_ID_PATH, env = "WANTUN_NODE_ID_FILE")]
    node_id_file: PathBuf,

    /// Path to the tunnel client binary
    #[arg(long, default_value = "sshuttle", env = "WANTUN_TUNNEL_BIN")]
    tunnel_bin: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "wantun_daemon=debug,wantun_core=debug"
    } else {
        "wantun_daemon=info,wantun_core=info"
    };
    wantun_core::tracing_init::init_tracing(default_filter);

    let reconciler = Reconciler::new();

    info!("removing any existing tunnel state");
    reconciler.reconcile().await;

    info!("running tunnel client");
    let result = run_tunnel(&args).await;

    // Guaranteed cleanup: runs whether the tunnel exited, failed to
    // launch, or the operator interrupted it.
    info!("cleaning up any lingering tunnel state");
    reconciler.reconcile().await;

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => Err(err),
    }
}

/// One supervised tunnel run, racing the child against operator signals.
async fn run_tunnel(args: &Args) -> anyhow::Result<i32> {
    let config = TunnelConfig::load(&args.config, &args.node_id_file)
        .context("failed to load tunnel configuration")?;

    let server_ip = resolve_server(&config.host, &config.port).await?;
    info!(host = %config.host, ip = %server_ip, "resolved tunnel server");

    let exclusions = exclusions::build(&config, server_ip, &UPLINK_INTERFACES).await;
    info!(count = exclusions.len(), "computed routing exclusions");

    let mut supervisor = TunnelSupervisor::new(config, exclusions, args.debug)
        .with_tunnel_bin(args.tunnel_bin.clone());
    let notifier = SystemdNotifier;

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = supervisor.run(&notifier) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(0)
        }
        _ = sigterm_future => {
            info!("received SIGTERM");
            Ok(0)
        }
    }
}

/// Resolve the tunnel server to its IPv4 address.
async fn resolve_server(host: &str, port: &str) -> anyhow::Result<IpAddr> {
    let addrs = tokio::net::lookup_host(format!("{host}:{port}"))
        .await
        .with_context(|| format!("failed to resolve tunnel server {host}"))?;
    addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| anyhow::anyhow!("no IPv4 address for tunnel server {host}"))
}

//! WireGuard Panel Daemon (wgpaneld)
//!
//! Converges live WireGuard interfaces, peers and packet filter rules to the
//! saved panel state at startup, then keeps polling peer counters.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo wgpaneld
//!
//! # Start with verbose logging
//! sudo wgpaneld --verbose
//!
//! # Converge once and exit
//! sudo wgpaneld --once
//! ```
//!
//! Send `SIGHUP` to re-run the convergence pass.

use anyhow::{Context, Result};
use clap::Parser;
use libwgpanel::config::{PanelConfig, DEFAULT_CONFIG_PATH};
use libwgpanel::control::{Host, WgQuick};
use libwgpanel::command::CommandRunner;
use libwgpanel::error::{PanelError, PanelResult};
use libwgpanel::{JsonFileStore, PanelManager, PidFile, TelemetryPoller};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// WireGuard Panel Daemon
#[derive(Parser, Debug)]
#[command(name = "wgpaneld")]
#[command(version)]
#[command(
    about = "WireGuard Panel Daemon - keeps WireGuard servers in sync with the panel state",
    long_about = None
)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run one convergence pass and exit
    #[arg(long)]
    once: bool,
}

/// Shared state for signal handling
struct DaemonState {
    /// Whether the daemon should continue running
    running: Arc<RwLock<bool>>,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(true)),
        }
    }

    async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Daemon stop requested");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting WireGuard Panel Daemon (wgpaneld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - interface and firewall changes will fail");
        }
    }

    let config = PanelConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.ensure_directories()?;

    let _pid_file = PidFile::acquire(&config.paths.pid_file)
        .context("another wgpaneld appears to be running")?;

    let wg_tools = WgQuick::new(CommandRunner::default(), config.paths.wireguard_dir.clone());
    if !wg_tools.is_available().await {
        warn!("wg/wg-quick not found in PATH - interfaces cannot be brought up");
    }

    let host = Host::system(&config);
    let store = Arc::new(JsonFileStore::new(config.paths.state_file.clone()));
    let manager = match PanelManager::open(store, host.clone(), config.clone()).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to load state from {}: {}", config.paths.state_file.display(), e);
            return Err(e.into());
        }
    };

    if config.runtime.manage_ip_forwarding {
        if let Err(e) = host.routing.enable_ip_forwarding().await {
            warn!("Failed to enable IPv4 forwarding: {}", e);
        }
    }

    let report = manager.converge().await;
    if report.changed_snapshot() {
        warn!("{} servers failed to come up and were disabled", report.demoted.len());
    }
    if report.failures() > 0 {
        warn!("Initial convergence finished with {} failures", report.failures());
    }

    if args.once {
        info!("Single pass requested, exiting");
        return Ok(());
    }

    let poller = TelemetryPoller::new(manager.clone(), config.runtime.poll_interval());
    poller.start().await?;

    let state = Arc::new(DaemonState::new());
    let state_clone = state.clone();
    let manager_clone = manager.clone();

    // Setup signal handlers
    tokio::spawn(async move {
        if let Err(e) = handle_signals(state_clone, manager_clone).await {
            error!("Signal handler error: {}", e);
        }
    });

    info!("WireGuard Panel Daemon is ready");

    // Main daemon loop
    while state.is_running().await {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    // Cleanup; live interfaces and rules are left in place
    info!("Shutting down WireGuard Panel Daemon...");
    poller.stop().await;

    info!("WireGuard Panel Daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("wgpaneld={},libwgpanel={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT stop; SIGHUP re-converges)
async fn handle_signals(state: Arc<DaemonState>, manager: Arc<PanelManager>) -> PanelResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let register = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| {
            PanelError::ConfigError(format!("Failed to register {} handler: {}", name, e))
        })
    };
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM")?;
    let mut sigint = register(SignalKind::interrupt(), "SIGINT")?;
    let mut sighup = register(SignalKind::hangup(), "SIGHUP")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, re-running convergence");
                let report = manager.converge().await;
                info!("Convergence after SIGHUP: {} failures", report.failures());
            }
        }
    }
}

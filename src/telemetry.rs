//! Telemetry poller
//!
//! Periodically reads per-peer counters of every enabled, live server and
//! merges them into the snapshot. Dumps run concurrently and outside the
//! mutation gate; only the merge and the save take it.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{PanelError, PanelResult};
use crate::manager::PanelManager;

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub servers_polled: usize,
    pub clients_updated: usize,
    pub failures: usize,
}

pub struct TelemetryPoller {
    manager: Arc<PanelManager>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryPoller {
    pub fn new(manager: Arc<PanelManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start polling in a background task
    pub async fn start(&self) -> PanelResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(PanelError::AlreadyExists("Telemetry poller already running".to_string()));
        }
        *running = true;
        drop(running);

        info!("Starting telemetry poller every {:?}", self.interval);

        let manager = self.manager.clone();
        let running = self.running.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            Self::poll_loop(manager, interval, running).await;
        });
        *self.handle.lock().await = Some(handle);

        Ok(())
    }

    /// Stop polling; an in-flight cycle is abandoned
    pub async fn stop(&self) {
        *self.running.write().await = false;
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("Stopped telemetry poller");
    }

    async fn poll_loop(manager: Arc<PanelManager>, interval: Duration, running: Arc<RwLock<bool>>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !*running.read().await {
                break;
            }

            let report = poll_once(&manager).await;
            debug!(
                "Poll cycle: {} servers, {} clients updated, {} failures",
                report.servers_polled, report.clients_updated, report.failures
            );
        }
    }
}

/// Run one poll cycle. The snapshot is saved even when nothing changed.
pub async fn poll_once(manager: &PanelManager) -> PollReport {
    let snapshot = manager.snapshot().await;
    let reconciler = manager.reconciler();
    let live = reconciler.live_interfaces().await;

    let targets: Vec<_> = snapshot
        .servers
        .iter()
        .filter(|s| s.enabled && live.contains(&s.interface))
        .collect();

    let peers = reconciler.host().peers.clone();
    let dumps = join_all(targets.iter().map(|server| {
        let peers = peers.clone();
        async move { (server, peers.dump(&server.interface).await) }
    }))
    .await;

    let mut report = PollReport {
        servers_polled: targets.len(),
        ..Default::default()
    };
    let mut batches = Vec::with_capacity(dumps.len());
    for (server, dump) in dumps {
        match dump {
            Ok(counters) => batches.push((server.id.clone(), counters)),
            Err(e) => {
                warn!("Failed to read counters of {}: {}", server.interface, e);
                report.failures += 1;
            }
        }
    }

    report.clients_updated = manager.apply_counters(batches).await;
    report
}

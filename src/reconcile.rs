//! Interface reconciliation
//!
//! Each server moves between three states:
//!
//! ```text
//!            create                  enable
//!  absent ──────────▶ down ─────────────────────▶ up
//!    ▲                 ▲ ◀───────────────────────  │
//!    │                 │        disable            │
//!    └─────────────────┴───────────────────────────┘
//!                        delete
//! ```
//!
//! Going up writes the artifact, brings the interface up, applies the server
//! rules, rebuilds the peer set and applies the forwards of every added
//! client. Going down removes forwards and server rules and brings the
//! interface down. Deletion additionally removes the artifact.
//!
//! [`Reconciler::converge`] runs a full pass over a snapshot. Every failure
//! is isolated to the entity it happened on; a server that fails to come up
//! is demoted to disabled.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::artifact;
use crate::control::Host;
use crate::error::PanelResult;
use crate::firewall::FirewallEngine;
use crate::model::{Client, Server, Snapshot};
use crate::peers::{PeerReconciler, PeerSyncReport};

/// What a full pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Live interfaces without a server that were taken down
    pub orphan_interfaces: Vec<String>,
    /// Leftover config files without a server that were deleted
    pub orphan_artifacts: Vec<String>,
    /// Servers brought up
    pub started: Vec<String>,
    /// Disabled servers taken down
    pub stopped: Vec<String>,
    /// Servers that failed to come up and were disabled
    pub demoted: Vec<String>,
    pub rule_failures: usize,
    pub peer_failures: usize,
    pub forward_failures: usize,
}

impl ConvergeReport {
    /// Whether the snapshot itself was changed by the pass
    pub fn changed_snapshot(&self) -> bool {
        !self.demoted.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.demoted.len() + self.rule_failures + self.peer_failures + self.forward_failures
    }
}

/// Result of bringing one server up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub rules_applied: bool,
    pub peers: PeerSyncReport,
}

#[derive(Clone)]
pub struct Reconciler {
    host: Host,
    firewall: FirewallEngine,
    peers: PeerReconciler,
}

impl Reconciler {
    pub fn new(host: Host) -> Self {
        let firewall = FirewallEngine::new(host.filter.clone(), host.routing.clone());
        let peers = PeerReconciler::new(host.peers.clone(), firewall.clone());
        Self { host, firewall, peers }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn firewall(&self) -> &FirewallEngine {
        &self.firewall
    }

    pub fn peers(&self) -> &PeerReconciler {
        &self.peers
    }

    /// Live interface names; a failed listing counts as none
    pub async fn live_interfaces(&self) -> Vec<String> {
        match self.host.link.live_interfaces().await {
            Ok(live) => live,
            Err(e) => {
                warn!("Failed to list live interfaces: {}", e);
                Vec::new()
            }
        }
    }

    /// Interface names with a config file; a failed listing counts as none
    pub async fn config_artifacts(&self) -> Vec<String> {
        match self.host.link.config_artifacts().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list config artifacts: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn is_live(&self, interface: &str) -> bool {
        self.live_interfaces().await.iter().any(|i| i == interface)
    }

    /// Drive live state to match `snapshot`.
    ///
    /// The only snapshot change is demotion of servers that failed to come
    /// up; the caller persists the snapshot afterwards.
    pub async fn converge(&self, snapshot: &mut Snapshot) -> ConvergeReport {
        let mut report = ConvergeReport::default();
        info!("Starting convergence pass over {} servers", snapshot.servers.len());

        let live = self.live_interfaces().await;
        let artifacts = self.config_artifacts().await;
        let desired: HashSet<String> =
            snapshot.servers.iter().map(|s| s.interface.clone()).collect();

        for iface in live.iter().filter(|i| !desired.contains(*i)) {
            info!("Removing orphan interface {}", iface);
            if let Err(e) = self.host.link.down(iface).await {
                warn!("Failed to bring down orphan interface {}: {}", iface, e);
            }
            self.firewall.remove_interface_rules(iface).await;
            if let Err(e) = self.host.link.delete_artifact(iface).await {
                warn!("Failed to delete config of orphan interface {}: {}", iface, e);
            }
            report.orphan_interfaces.push(iface.clone());
        }

        for name in artifacts.iter().filter(|a| !desired.contains(*a) && !live.contains(*a)) {
            info!("Removing leftover config for {}", name);
            match self.host.link.delete_artifact(name).await {
                Ok(()) => report.orphan_artifacts.push(name.clone()),
                Err(e) => warn!("Failed to delete leftover config {}: {}", name, e),
            }
        }

        for idx in 0..snapshot.servers.len() {
            let server = snapshot.servers[idx].clone();
            let clients = snapshot.clients_of(&server.id);
            let is_live = live.contains(&server.interface);

            if !server.enabled {
                if let Err(e) = self.refresh_artifact(&server, &clients).await {
                    warn!("Failed to write config for {}: {}", server.interface, e);
                }
                if is_live {
                    match self.stop_server(&server, &clients).await {
                        Ok(()) => report.stopped.push(server.id.clone()),
                        Err(e) => warn!("Failed to bring down {}: {}", server.interface, e),
                    }
                }
                continue;
            }

            if is_live {
                debug!("Cycling live interface {}", server.interface);
                if let Err(e) = self.stop_server(&server, &clients).await {
                    warn!("Failed to bring down {} before restart: {}", server.interface, e);
                }
            }

            match self.start_server(&server, &clients).await {
                Ok(start) => {
                    if !start.rules_applied {
                        report.rule_failures += 1;
                    }
                    report.peer_failures += start.peers.failed.len();
                    report.forward_failures += start.peers.forward_failures;
                    report.started.push(server.id.clone());
                }
                Err(e) => {
                    warn!(
                        "Server {} ({}) failed to come up, disabling: {}",
                        server.name, server.interface, e
                    );
                    snapshot.servers[idx].enabled = false;
                    report.demoted.push(server.id.clone());
                }
            }
        }

        info!(
            "Convergence pass done: {} up, {} down, {} demoted, {} orphans removed, {} failures",
            report.started.len(),
            report.stopped.len(),
            report.demoted.len(),
            report.orphan_interfaces.len() + report.orphan_artifacts.len(),
            report.failures()
        );
        report
    }

    /// Write the artifact and bring the server up with rules, peers and
    /// forwards. Only a failed artifact write or interface up is an error.
    pub async fn start_server(
        &self,
        server: &Server,
        clients: &[Client],
    ) -> PanelResult<StartReport> {
        self.refresh_artifact(server, clients).await?;
        self.host.link.up(&server.interface).await?;

        let rules_applied = match self.firewall.apply_server_rules(server).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to apply server rules for {}: {}", server.interface, e);
                false
            }
        };

        let peers = self.peers.sync(server, clients).await;
        info!("Server {} is up on {}", server.name, server.interface);
        Ok(StartReport { rules_applied, peers })
    }

    /// Remove forwards and server rules, then bring the interface down
    pub async fn stop_server(&self, server: &Server, clients: &[Client]) -> PanelResult<()> {
        for client in clients.iter().filter(|c| c.server_id == server.id) {
            self.firewall.remove_client_forwards(client).await;
        }
        self.firewall.remove_server_rules(server).await;
        self.host.link.down(&server.interface).await?;
        info!("Server {} is down", server.name);
        Ok(())
    }

    /// Tear a server down completely, including its config file
    pub async fn remove_server(&self, server: &Server, clients: &[Client]) -> PanelResult<()> {
        if self.is_live(&server.interface).await {
            if let Err(e) = self.stop_server(server, clients).await {
                warn!("Failed to bring down {} during removal: {}", server.interface, e);
            }
        } else {
            for client in clients.iter().filter(|c| c.server_id == server.id) {
                self.firewall.remove_client_forwards(client).await;
            }
            self.firewall.remove_server_rules(server).await;
        }
        self.host.link.delete_artifact(&server.interface).await
    }

    /// Rewrite the server's config file from the current client set
    pub async fn refresh_artifact(&self, server: &Server, clients: &[Client]) -> PanelResult<()> {
        let content = artifact::render_server_config(server, clients);
        self.host.link.write_artifact(&server.interface, &content).await
    }
}

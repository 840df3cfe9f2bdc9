//! Peer set reconciliation
//!
//! Makes one interface's live peers equal to the enabled clients of its
//! server by clearing every live peer and re-adding the desired ones.
//! Between the removal and the add a connected client briefly has no peer
//! entry.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control::PeerControl;
use crate::error::PanelResult;
use crate::firewall::FirewallEngine;
use crate::model::{Client, Server};

/// Outcome of one peer sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSyncReport {
    pub removed: usize,
    pub added: usize,
    /// Client ids whose peer add failed
    pub failed: Vec<String>,
    /// Port forwards that failed to apply
    pub forward_failures: usize,
}

#[derive(Clone)]
pub struct PeerReconciler {
    peers: Arc<dyn PeerControl>,
    firewall: FirewallEngine,
}

impl PeerReconciler {
    pub fn new(peers: Arc<dyn PeerControl>, firewall: FirewallEngine) -> Self {
        Self { peers, firewall }
    }

    /// Clear and rebuild the peers of `server`, then apply the port forwards
    /// of every client that was added.
    pub async fn sync(&self, server: &Server, clients: &[Client]) -> PeerSyncReport {
        let mut report = PeerSyncReport::default();
        let iface = server.interface.as_str();

        match self.peers.peers(iface).await {
            Ok(live) => {
                for key in live {
                    match self.peers.remove_peer(iface, &key).await {
                        Ok(()) => report.removed += 1,
                        Err(e) => warn!("Failed to remove peer {} from {}: {}", key, iface, e),
                    }
                }
            }
            Err(e) => warn!("Failed to list peers of {}: {}", iface, e),
        }

        for client in clients.iter().filter(|c| c.server_id == server.id && c.enabled) {
            match self.add_client(server, client).await {
                Ok(forward_failures) => {
                    report.added += 1;
                    report.forward_failures += forward_failures;
                }
                Err(e) => {
                    warn!(
                        "Failed to add peer for client {} on {}: {}",
                        client.name, iface, e
                    );
                    report.failed.push(client.id.clone());
                }
            }
        }

        info!(
            "Peers of {}: {} removed, {} added, {} failed",
            iface,
            report.removed,
            report.added,
            report.failed.len()
        );
        report
    }

    /// Add one client as a peer and apply its forwards.
    ///
    /// Returns the number of failed forwards. When the peer itself cannot be
    /// added its forwards are skipped.
    pub async fn add_client(&self, server: &Server, client: &Client) -> PanelResult<usize> {
        self.peers
            .add_peer(&server.interface, &client.public_key, &client.allowed_ip())
            .await?;

        debug!("Peer {} added on {}", client.allowed_ip(), server.interface);
        Ok(self.firewall.apply_client_forwards(client).await)
    }

    /// Whether `client` has a live peer entry on its server.
    /// A failed listing counts as absent.
    pub async fn is_present(&self, server: &Server, client: &Client) -> bool {
        match self.peers.peers(&server.interface).await {
            Ok(live) => live.iter().any(|key| *key == client.public_key),
            Err(e) => {
                debug!("Failed to list peers of {}: {}", server.interface, e);
                false
            }
        }
    }

    /// Remove one client's peer and its forwards; best effort
    pub async fn remove_client(&self, server: &Server, client: &Client) {
        self.firewall.remove_client_forwards(client).await;
        if let Err(e) = self.peers.remove_peer(&server.interface, &client.public_key).await {
            debug!(
                "Ignoring failed peer removal for {} on {}: {}",
                client.name, server.interface, e
            );
        }
    }
}

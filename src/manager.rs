//! Panel manager
//!
//! Owns the desired-state snapshot behind a single mutation gate. Every
//! operation holds the gate for its whole read-modify-persist sequence, so
//! the reconciler, the telemetry poller and user requests never interleave.
//!
//! Mutations apply incremental per-entity transitions. A full convergence
//! pass is only run through [`PanelManager::converge`].

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::artifact;
use crate::config::PanelConfig;
use crate::control::Host;
use crate::error::{PanelError, PanelResult};
use crate::keys::{self, KeyPair};
use crate::model::{Client, PeerCounters, PortForward, Protocol, Server, Snapshot};
use crate::reconcile::{ConvergeReport, Reconciler};
use crate::store::StateStore;
use crate::validation;

/// Request to create a server; unset address and port are allocated
#[derive(Debug, Clone, Default)]
pub struct NewServer {
    pub name: String,
    pub address: Option<String>,
    pub listen_port: Option<u32>,
    pub dns: Option<String>,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
    /// Leave the new server down
    pub disabled: bool,
}

impl NewServer {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Fields of a server that may change after creation
#[derive(Debug, Clone, Default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub dns: Option<String>,
    pub listen_port: Option<u32>,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
}

/// A rendered client profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientProfile {
    pub file_name: String,
    pub content: String,
}

pub struct PanelManager {
    state: Mutex<Snapshot>,
    store: Arc<dyn StateStore>,
    reconciler: Reconciler,
    config: PanelConfig,
}

impl PanelManager {
    /// Load the snapshot, starting empty when none was saved yet.
    ///
    /// Server public keys are re-derived from the private keys and lagging
    /// client counters are moved forward. Any other load or save failure is
    /// fatal here.
    pub async fn open(
        store: Arc<dyn StateStore>,
        host: Host,
        config: PanelConfig,
    ) -> PanelResult<Self> {
        let mut snapshot = match store.load().await {
            Ok(snapshot) => snapshot,
            Err(PanelError::NotFound(what)) => {
                info!("No saved state at {}, starting empty", what);
                let snapshot = Snapshot::default();
                store.save(&snapshot).await?;
                snapshot
            }
            Err(e) => return Err(e),
        };

        let mut repaired = false;
        let clients = snapshot.clients.clone();
        for server in snapshot.servers.iter_mut() {
            match keys::public_key_for(&server.private_key) {
                Ok(public_key) if public_key != server.public_key => {
                    warn!(
                        "Public key of {} does not match its private key, replacing it",
                        server.name
                    );
                    server.public_key = public_key;
                    repaired = true;
                }
                Ok(_) => {}
                Err(e) => warn!("Server {} has an unusable private key: {}", server.name, e),
            }
            if allocator::resync_client_counter(server, &clients) {
                warn!(
                    "Client counter of {} lagged behind allocated addresses, now {}",
                    server.name, server.next_client_ip
                );
                repaired = true;
            }
        }
        if repaired {
            store.save(&snapshot).await?;
        }

        info!(
            "Loaded {} servers and {} clients",
            snapshot.servers.len(),
            snapshot.clients.len()
        );

        Ok(Self {
            state: Mutex::new(snapshot),
            store,
            reconciler: Reconciler::new(host),
            config,
        })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    /// Consistent copy of the current snapshot
    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.clone()
    }

    pub async fn list_servers(&self) -> Vec<Server> {
        self.state.lock().await.servers.clone()
    }

    /// Clients, optionally only those of one server
    pub async fn list_clients(&self, server_id: Option<&str>) -> Vec<Client> {
        let snap = self.state.lock().await;
        snap.clients
            .iter()
            .filter(|c| server_id.map_or(true, |id| c.server_id == id))
            .cloned()
            .collect()
    }

    /// Full convergence pass, then persist
    pub async fn converge(&self) -> ConvergeReport {
        let mut guard = self.state.lock().await;
        let report = self.reconciler.converge(&mut guard).await;
        self.persist(&guard).await;
        report
    }

    pub async fn create_server(&self, req: NewServer) -> PanelResult<Server> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;

        let name = validation::validate_name(&req.name)?;
        let address = match req.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => validation::parse_server_address(address)?,
            None => allocator::next_available_subnet(snap)?,
        };
        let listen_port = match req.listen_port {
            Some(port) => validation::validate_port(port)?,
            None => allocator::next_available_port(snap)?,
        };
        validation::validate_server_config(snap, &address, listen_port, None)?;

        let dns = match req.dns {
            Some(dns) => validation::sanitize_config_value(dns.trim())?,
            None => self.config.clients.default_dns.clone(),
        };
        let post_up = validation::sanitize_config_value(req.post_up.as_deref().unwrap_or(""))?;
        let post_down = validation::sanitize_config_value(req.post_down.as_deref().unwrap_or(""))?;

        let live = self.reconciler.live_interfaces().await;
        let artifacts = self.reconciler.config_artifacts().await;
        let interface = allocator::next_interface_name(snap, &live, &artifacts)?;

        let keys = KeyPair::generate();
        let mut server = Server {
            id: Uuid::new_v4().to_string(),
            name,
            interface,
            private_key: keys.private_key,
            public_key: keys.public_key,
            address,
            listen_port,
            dns,
            enabled: !req.disabled,
            created_at: Utc::now(),
            post_up,
            post_down,
            next_client_ip: *allocator::CLIENT_HOST_OCTETS.start(),
        };

        if server.enabled {
            if let Err(e) = self.reconciler.start_server(&server, &[]).await {
                warn!("New server {} failed to come up, leaving it disabled: {}", server.name, e);
                server.enabled = false;
            }
        } else if let Err(e) = self.reconciler.refresh_artifact(&server, &[]).await {
            warn!("Failed to write config for {}: {}", server.interface, e);
        }

        info!(
            "Created server {} ({}, {}, port {})",
            server.name, server.interface, server.address, server.listen_port
        );
        snap.servers.push(server.clone());
        self.persist(snap).await;
        Ok(server)
    }

    pub async fn update_server(&self, id: &str, update: ServerUpdate) -> PanelResult<Server> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.server_index(id)?;
        let mut server = snap.servers[idx].clone();

        if let Some(name) = &update.name {
            server.name = validation::validate_name(name)?;
        }
        if let Some(dns) = &update.dns {
            server.dns = validation::sanitize_config_value(dns.trim())?;
        }
        if let Some(hook) = &update.post_up {
            server.post_up = validation::sanitize_config_value(hook)?;
        }
        if let Some(hook) = &update.post_down {
            server.post_down = validation::sanitize_config_value(hook)?;
        }
        if let Some(port) = update.listen_port {
            server.listen_port = validation::validate_port(port)?;
            if !allocator::is_listen_port_available(snap, server.listen_port, Some(id)) {
                return Err(PanelError::Validation(format!(
                    "Port {} is already in use",
                    server.listen_port
                )));
            }
        }

        let needs_cycle = server.listen_port != snap.servers[idx].listen_port
            || server.post_up != snap.servers[idx].post_up
            || server.post_down != snap.servers[idx].post_down;
        let clients = snap.clients_of(id);

        if server.enabled && needs_cycle {
            if let Err(e) = self.reconciler.stop_server(&server, &clients).await {
                warn!("Failed to bring down {} for restart: {}", server.interface, e);
            }
            if let Err(e) = self.reconciler.start_server(&server, &clients).await {
                warn!("Server {} failed to come back up, disabling: {}", server.name, e);
                server.enabled = false;
            }
        } else if let Err(e) = self.reconciler.refresh_artifact(&server, &clients).await {
            warn!("Failed to write config for {}: {}", server.interface, e);
        }

        info!("Updated server {}", server.name);
        snap.servers[idx] = server.clone();
        self.persist(snap).await;
        Ok(server)
    }

    /// Enabled goes down, disabled comes up.
    ///
    /// A server that fails to come up stays disabled and the error is
    /// returned.
    pub async fn toggle_server(&self, id: &str) -> PanelResult<Server> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.server_index(id)?;
        let server = snap.servers[idx].clone();
        let clients = snap.clients_of(id);

        if server.enabled {
            if let Err(e) = self.reconciler.stop_server(&server, &clients).await {
                warn!("Failed to bring down {}: {}", server.interface, e);
            }
            snap.servers[idx].enabled = false;
        } else {
            let mut enabled = server.clone();
            enabled.enabled = true;
            self.reconciler.start_server(&enabled, &clients).await?;
            snap.servers[idx].enabled = true;
        }

        info!(
            "Server {} is now {}",
            server.name,
            if snap.servers[idx].enabled { "enabled" } else { "disabled" }
        );
        let server = snap.servers[idx].clone();
        self.persist(snap).await;
        Ok(server)
    }

    /// Remove a server together with all of its clients.
    /// Returns the number of clients removed.
    pub async fn delete_server(&self, id: &str) -> PanelResult<usize> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.server_index(id)?;
        let server = snap.servers[idx].clone();
        let clients = snap.clients_of(id);

        if let Err(e) = self.reconciler.remove_server(&server, &clients).await {
            warn!("Failed to clean up {}: {}", server.interface, e);
        }

        snap.clients.retain(|c| c.server_id != id);
        snap.servers.remove(idx);

        info!("Deleted server {} and {} clients", server.name, clients.len());
        self.persist(snap).await;
        Ok(clients.len())
    }

    pub async fn create_client(
        &self,
        server_id: &str,
        name: &str,
        comment: &str,
    ) -> PanelResult<Client> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let sidx = snap.server_index(server_id)?;

        let name = validation::validate_name(name)?;
        let comment = validation::sanitize_config_value(comment.trim())?;
        let address = allocator::next_client_address(&mut snap.servers[sidx], &snap.clients)?;

        let keys = KeyPair::generate();
        let client = Client {
            id: Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            name,
            public_key: keys.public_key,
            private_key: keys.private_key,
            address,
            enabled: true,
            comment,
            created_at: Utc::now(),
            rx_bytes: 0,
            tx_bytes: 0,
            last_handshake: None,
            endpoint: String::new(),
            port_forwards: Vec::new(),
        };
        snap.clients.push(client.clone());

        let server = snap.servers[sidx].clone();
        if server.enabled {
            if let Err(e) = self.reconciler.peers().add_client(&server, &client).await {
                warn!("Failed to add peer for new client {}: {}", client.name, e);
            }
        }
        self.refresh_artifact_logged(snap, &server).await;

        info!("Created client {} ({}) on {}", client.name, client.address, server.name);
        self.persist(snap).await;
        Ok(client)
    }

    pub async fn update_client(
        &self,
        id: &str,
        name: Option<&str>,
        comment: Option<&str>,
    ) -> PanelResult<Client> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(id)?;

        let name = name.map(validation::validate_name).transpose()?;
        let comment = comment
            .map(|c| validation::sanitize_config_value(c.trim()))
            .transpose()?;

        let client = &mut snap.clients[idx];
        if let Some(name) = name {
            client.name = name;
        }
        if let Some(comment) = comment {
            client.comment = comment;
        }

        let client = client.clone();
        self.persist(snap).await;
        Ok(client)
    }

    /// Flip a client. Disabling removes its peer and forwards but keeps its
    /// address; enabling restores both.
    pub async fn toggle_client(&self, id: &str) -> PanelResult<Client> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(id)?;
        snap.clients[idx].enabled = !snap.clients[idx].enabled;

        let client = snap.clients[idx].clone();
        let server = snap.server(&client.server_id).cloned().ok_or_else(|| {
            PanelError::NotFound(format!(
                "Server {} of client {} not found",
                client.server_id, client.name
            ))
        })?;

        if server.enabled {
            if client.enabled {
                if let Err(e) = self.reconciler.peers().add_client(&server, &client).await {
                    warn!("Failed to add peer for client {}: {}", client.name, e);
                }
            } else {
                self.reconciler.peers().remove_client(&server, &client).await;
            }
        }
        self.refresh_artifact_logged(snap, &server).await;

        info!(
            "Client {} is now {}",
            client.name,
            if client.enabled { "enabled" } else { "disabled" }
        );
        self.persist(snap).await;
        Ok(client)
    }

    pub async fn delete_client(&self, id: &str) -> PanelResult<()> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(id)?;
        let client = snap.clients.remove(idx);

        match snap.server(&client.server_id).cloned() {
            Some(server) => {
                self.reconciler.peers().remove_client(&server, &client).await;
                self.refresh_artifact_logged(snap, &server).await;
            }
            None => self.reconciler.firewall().remove_client_forwards(&client).await,
        }

        info!("Deleted client {}", client.name);
        self.persist(snap).await;
        Ok(())
    }

    /// Publish `port` to a client.
    ///
    /// Rules are applied right away when the client is enabled and its peer
    /// is live on an enabled server; otherwise they follow the next peer add.
    /// If applying fails, whatever was applied is removed and the forward is
    /// not recorded.
    pub async fn add_port_forward(
        &self,
        client_id: &str,
        port: u32,
        protocol: Protocol,
        description: &str,
    ) -> PanelResult<PortForward> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(client_id)?;

        let port = validation::validate_port(port)?;
        let description = validation::sanitize_config_value(description.trim())?;
        if !allocator::is_port_forward_available(snap, port, protocol) {
            return Err(PanelError::Validation(format!(
                "Port {}/{} is already forwarded",
                port, protocol
            )));
        }

        let forward = PortForward { port, protocol, description };
        let client = snap.clients[idx].clone();
        let server = snap.server(&client.server_id).filter(|s| s.enabled).cloned();

        if let Some(server) = server.filter(|_| client.enabled) {
            if self.reconciler.peers().is_present(&server, &client).await {
                let firewall = self.reconciler.firewall();
                if let Err(e) = firewall.apply_port_forward(&client, &forward).await {
                    firewall.remove_port_forward(&client, &forward).await;
                    return Err(e);
                }
            } else {
                info!(
                    "Client {} has no live peer on {}, forward {}/{} waits for the next peer add",
                    client.name, server.interface, port, protocol
                );
            }
        }

        info!("Forwarding {}/{} to {} ({})", port, protocol, client.address, client.name);
        snap.clients[idx].port_forwards.push(forward.clone());
        self.persist(snap).await;
        Ok(forward)
    }

    /// Change the description of an existing forward
    pub async fn update_port_forward(
        &self,
        client_id: &str,
        port: u16,
        protocol: Protocol,
        description: &str,
    ) -> PanelResult<PortForward> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(client_id)?;
        let description = validation::sanitize_config_value(description.trim())?;

        let forward = snap.clients[idx]
            .port_forwards
            .iter_mut()
            .find(|pf| pf.port == port && pf.protocol == protocol)
            .ok_or_else(|| {
                PanelError::NotFound(format!("Port forward {}/{} not found", port, protocol))
            })?;
        forward.description = description;

        let forward = forward.clone();
        self.persist(snap).await;
        Ok(forward)
    }

    pub async fn remove_port_forward(
        &self,
        client_id: &str,
        port: u16,
        protocol: Protocol,
    ) -> PanelResult<()> {
        let mut guard = self.state.lock().await;
        let snap = &mut *guard;
        let idx = snap.client_index(client_id)?;

        let pos = snap.clients[idx]
            .port_forwards
            .iter()
            .position(|pf| pf.port == port && pf.protocol == protocol)
            .ok_or_else(|| {
                PanelError::NotFound(format!("Port forward {}/{} not found", port, protocol))
            })?;

        let forward = snap.clients[idx].port_forwards.remove(pos);
        let client = snap.clients[idx].clone();
        self.reconciler.firewall().remove_port_forward(&client, &forward).await;

        info!("Removed forward {}/{} from {}", port, protocol, client.name);
        self.persist(snap).await;
        Ok(())
    }

    /// Render the profile of a client.
    ///
    /// `endpoint` overrides the configured public host.
    pub async fn client_config(
        &self,
        id: &str,
        endpoint: Option<&str>,
    ) -> PanelResult<ClientProfile> {
        let snap = self.state.lock().await;
        let client = &snap.clients[snap.client_index(id)?];
        let server = snap
            .server(&client.server_id)
            .ok_or_else(|| PanelError::NotFound(format!("Server {} not found", client.server_id)))?;

        let endpoint = endpoint
            .map(str::to_string)
            .or_else(|| self.config.clients.endpoint.clone())
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                PanelError::ConfigError(
                    "No public endpoint configured (clients.endpoint)".to_string(),
                )
            })?;
        let endpoint = validation::sanitize_config_value(endpoint.trim())?;

        Ok(ClientProfile {
            file_name: format!("{}.conf", validation::sanitize_filename(&client.name)),
            content: artifact::render_client_config(
                client,
                server,
                &endpoint,
                self.config.clients.persistent_keepalive,
            ),
        })
    }

    /// Merge counters collected outside the gate, then persist once.
    /// Returns how many clients were updated.
    pub async fn apply_counters(&self, batches: Vec<(String, Vec<PeerCounters>)>) -> usize {
        let mut guard = self.state.lock().await;
        let merged: usize = batches
            .iter()
            .map(|(server_id, counters)| guard.merge_counters(server_id, counters))
            .sum();
        self.persist(&guard).await;
        merged
    }

    async fn refresh_artifact_logged(&self, snap: &Snapshot, server: &Server) {
        let clients = snap.clients_of(&server.id);
        if let Err(e) = self.reconciler.refresh_artifact(server, &clients).await {
            warn!("Failed to write config for {}: {}", server.interface, e);
        }
    }

    /// Save; after startup a failure leaves the in-memory snapshot in charge
    async fn persist(&self, snap: &Snapshot) {
        if let Err(e) = self.store.save(snap).await {
            warn!("Failed to persist state, keeping in-memory copy: {}", e);
        }
    }
}

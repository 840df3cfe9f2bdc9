//! In-memory host shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use libwgpanel::control::{FilterRule, Host, LinkControl, PacketFilter, PeerControl, Routing};
use libwgpanel::config::PanelConfig;
use libwgpanel::error::{PanelError, PanelResult};
use libwgpanel::model::PeerCounters;
use libwgpanel::store::MemoryStore;
use libwgpanel::PanelManager;

#[derive(Default)]
pub struct HostState {
    pub live: BTreeSet<String>,
    pub artifacts: BTreeMap<String, String>,
    /// interface -> (public key, allowed ip)
    pub peers: BTreeMap<String, Vec<(String, String)>>,
    pub rules: Vec<FilterRule>,
    pub counters: HashMap<String, Vec<PeerCounters>>,
    pub fail_up: HashSet<String>,
    pub fail_peer_keys: HashSet<String>,
    pub fail_rules: Vec<FilterRule>,
    pub forwarding_enabled: bool,
}

/// Fake of every host collaborator
#[derive(Default)]
pub struct FakeHost {
    pub state: Mutex<HostState>,
}

fn failed(cmd: &str, stderr: &str) -> PanelError {
    PanelError::CommandFailed {
        cmd: cmd.to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

/// `[Peer]` entries of a rendered server config
fn peers_in_artifact(content: &str) -> Vec<(String, String)> {
    let mut peers = Vec::new();
    let mut key = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("PublicKey = ") {
            key = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("AllowedIPs = ") {
            if let Some(k) = key.take() {
                peers.push((k, value.to_string()));
            }
        }
    }
    peers
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host(self: &Arc<Self>) -> Host {
        Host {
            link: self.clone(),
            peers: self.clone(),
            filter: self.clone(),
            routing: self.clone(),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn live(&self) -> Vec<String> {
        self.with(|s| s.live.iter().cloned().collect())
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.with(|s| s.artifacts.keys().cloned().collect())
    }

    pub fn artifact(&self, iface: &str) -> Option<String> {
        self.with(|s| s.artifacts.get(iface).cloned())
    }

    pub fn peer_set(&self, iface: &str) -> Vec<(String, String)> {
        self.with(|s| {
            let mut peers = s.peers.get(iface).cloned().unwrap_or_default();
            peers.sort();
            peers
        })
    }

    pub fn rules(&self) -> Vec<FilterRule> {
        self.with(|s| s.rules.clone())
    }

    pub fn rules_for_port(&self, port: u16) -> Vec<FilterRule> {
        self.rules()
            .into_iter()
            .filter(|r| match r {
                FilterRule::PortRedirect { port: p, .. }
                | FilterRule::PortAccept { port: p, .. } => *p == port,
                _ => false,
            })
            .collect()
    }
}

#[async_trait]
impl LinkControl for FakeHost {
    async fn live_interfaces(&self) -> PanelResult<Vec<String>> {
        Ok(self.live())
    }

    async fn config_artifacts(&self) -> PanelResult<Vec<String>> {
        Ok(self.artifacts())
    }

    async fn write_artifact(&self, interface: &str, content: &str) -> PanelResult<()> {
        self.with(|s| {
            s.artifacts.insert(interface.to_string(), content.to_string());
        });
        Ok(())
    }

    async fn delete_artifact(&self, interface: &str) -> PanelResult<()> {
        self.with(|s| {
            s.artifacts.remove(interface);
        });
        Ok(())
    }

    async fn up(&self, interface: &str) -> PanelResult<()> {
        self.with(|s| -> PanelResult<()> {
            if s.fail_up.contains(interface) {
                return Err(failed("wg-quick up", "RTNETLINK answers: Address already in use"));
            }
            if s.live.contains(interface) {
                return Err(failed("wg-quick up", &format!("`{}' already exists", interface)));
            }
            let content = s
                .artifacts
                .get(interface)
                .cloned()
                .ok_or_else(|| failed("wg-quick up", "config file missing"))?;
            s.live.insert(interface.to_string());
            s.peers.insert(interface.to_string(), peers_in_artifact(&content));
            Ok(())
        })
    }

    async fn down(&self, interface: &str) -> PanelResult<()> {
        self.with(|s| {
            if !s.live.remove(interface) {
                let msg = format!("`{}' is not a WireGuard interface", interface);
                return Err(failed("wg-quick down", &msg));
            }
            s.peers.remove(interface);
            Ok(())
        })
    }
}

#[async_trait]
impl PeerControl for FakeHost {
    async fn peers(&self, interface: &str) -> PanelResult<Vec<String>> {
        self.with(|s| {
            if !s.live.contains(interface) {
                return Err(failed("wg show", "No such device"));
            }
            Ok(s.peers
                .get(interface)
                .map(|p| p.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>())
                .unwrap_or_default())
        })
    }

    async fn add_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ip: &str,
    ) -> PanelResult<()> {
        self.with(|s| {
            if !s.live.contains(interface) {
                return Err(failed("wg set", "No such device"));
            }
            if s.fail_peer_keys.contains(public_key) {
                return Err(failed("wg set", "Invalid argument"));
            }
            let peers = s.peers.entry(interface.to_string()).or_default();
            peers.retain(|(k, _)| k != public_key);
            peers.push((public_key.to_string(), allowed_ip.to_string()));
            Ok(())
        })
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> PanelResult<()> {
        self.with(|s| {
            if !s.live.contains(interface) {
                return Err(failed("wg set", "No such device"));
            }
            if let Some(peers) = s.peers.get_mut(interface) {
                peers.retain(|(k, _)| k != public_key);
            }
            Ok(())
        })
    }

    async fn dump(&self, interface: &str) -> PanelResult<Vec<PeerCounters>> {
        self.with(|s| {
            if !s.live.contains(interface) {
                return Err(failed("wg show", "No such device"));
            }
            Ok(s.counters.get(interface).cloned().unwrap_or_default())
        })
    }
}

#[async_trait]
impl PacketFilter for FakeHost {
    async fn exists(&self, rule: &FilterRule) -> PanelResult<bool> {
        Ok(self.with(|s| s.rules.contains(rule)))
    }

    async fn insert(&self, rule: &FilterRule) -> PanelResult<()> {
        self.with(|s| {
            if s.fail_rules.contains(rule) {
                return Err(failed("iptables", "iptables: No chain/target/match by that name."));
            }
            s.rules.push(rule.clone());
            Ok(())
        })
    }

    async fn delete(&self, rule: &FilterRule) -> PanelResult<()> {
        self.with(|s| match s.rules.iter().position(|r| r == rule) {
            Some(pos) => {
                s.rules.remove(pos);
                Ok(())
            }
            None => Err(failed(
                "iptables",
                "Bad rule (does a matching rule exist in that chain?).",
            )),
        })
    }
}

#[async_trait]
impl Routing for FakeHost {
    async fn default_egress_interface(&self) -> String {
        "eth0".to_string()
    }

    async fn enable_ip_forwarding(&self) -> PanelResult<()> {
        self.with(|s| s.forwarding_enabled = true);
        Ok(())
    }
}

/// Manager over a fresh fake host and memory store
pub async fn manager() -> (Arc<PanelManager>, Arc<FakeHost>, Arc<MemoryStore>) {
    let fake = FakeHost::new();
    let store = Arc::new(MemoryStore::new());
    let manager = PanelManager::open(store.clone(), fake.host(), PanelConfig::default())
        .await
        .unwrap();
    (Arc::new(manager), fake, store)
}

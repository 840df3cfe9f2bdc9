//! Host control seams
//!
//! The reconciler never runs commands itself. It talks to the host through
//! four traits, one per collaborator:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Reconciler / Manager / Poller         │
//! └───────┬────────────┬────────────┬───────────┬┘
//!         ▼            ▼            ▼           ▼
//!   LinkControl   PeerControl  PacketFilter   Routing
//!   (wg-quick)       (wg)       (iptables)   (ip, sysctl)
//! ```
//!
//! [`Host::system`] wires the real implementations; tests substitute an
//! in-memory host.

pub mod iptables;
pub mod wireguard;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::command::CommandRunner;
use crate::config::PanelConfig;
use crate::error::PanelResult;
use crate::model::{PeerCounters, Protocol};
use crate::routing::RoutingController;

pub use iptables::Iptables;
pub use wireguard::WgQuick;

/// Live interfaces and their config artifacts
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Names of the WireGuard interfaces currently up
    async fn live_interfaces(&self) -> PanelResult<Vec<String>>;

    /// Interface names that have a config artifact on disk
    async fn config_artifacts(&self) -> PanelResult<Vec<String>>;

    /// Create or replace the artifact for `interface`
    async fn write_artifact(&self, interface: &str, content: &str) -> PanelResult<()>;

    /// Remove the artifact for `interface`; absent is not an error
    async fn delete_artifact(&self, interface: &str) -> PanelResult<()>;

    /// Bring `interface` up from its artifact
    async fn up(&self, interface: &str) -> PanelResult<()>;

    /// Bring `interface` down
    async fn down(&self, interface: &str) -> PanelResult<()>;
}

/// Peers of a live interface
#[async_trait]
pub trait PeerControl: Send + Sync {
    /// Public keys of all peers on `interface`
    async fn peers(&self, interface: &str) -> PanelResult<Vec<String>>;

    async fn add_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ip: &str,
    ) -> PanelResult<()>;

    async fn remove_peer(&self, interface: &str, public_key: &str) -> PanelResult<()>;

    /// Per-peer counters of `interface`
    async fn dump(&self, interface: &str) -> PanelResult<Vec<PeerCounters>>;
}

/// Packet filter rules owned by the panel
#[async_trait]
pub trait PacketFilter: Send + Sync {
    async fn exists(&self, rule: &FilterRule) -> PanelResult<bool>;

    async fn insert(&self, rule: &FilterRule) -> PanelResult<()>;

    async fn delete(&self, rule: &FilterRule) -> PanelResult<()>;
}

/// Host routing facts and forwarding switch
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Routing: Send + Sync {
    /// Primary outbound interface; falls back to a configured name
    async fn default_egress_interface(&self) -> String;

    async fn enable_ip_forwarding(&self) -> PanelResult<()>;
}

/// One packet filter rule, independent of the filter backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterRule {
    /// Accept forwarded traffic entering from the VPN interface
    ForwardIn { interface: String },
    /// Accept forwarded traffic leaving through the VPN interface
    ForwardOut { interface: String },
    /// Masquerade the VPN subnet on the egress interface
    Masquerade { network: Ipv4Net, egress: String },
    /// DNAT `port` arriving on the egress interface to a client
    PortRedirect {
        egress: String,
        protocol: Protocol,
        port: u16,
        destination: Ipv4Addr,
    },
    /// Accept forwarded traffic to the redirected client port
    PortAccept {
        protocol: Protocol,
        port: u16,
        destination: Ipv4Addr,
    },
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterRule::ForwardIn { interface } => write!(f, "forward in {}", interface),
            FilterRule::ForwardOut { interface } => write!(f, "forward out {}", interface),
            FilterRule::Masquerade { network, egress } => {
                write!(f, "masquerade {} via {}", network, egress)
            }
            FilterRule::PortRedirect { egress, protocol, port, destination } => {
                write!(f, "redirect {}/{} on {} to {}", port, protocol, egress, destination)
            }
            FilterRule::PortAccept { protocol, port, destination } => {
                write!(f, "accept {}/{} to {}", port, protocol, destination)
            }
        }
    }
}

/// The set of host collaborators the core works through
#[derive(Clone)]
pub struct Host {
    pub link: Arc<dyn LinkControl>,
    pub peers: Arc<dyn PeerControl>,
    pub filter: Arc<dyn PacketFilter>,
    pub routing: Arc<dyn Routing>,
}

impl Host {
    /// Real implementations backed by wg-quick, wg, iptables, ip and sysctl
    pub fn system(config: &PanelConfig) -> Self {
        let runner = CommandRunner::new(
            config.runtime.command_timeout(),
            config.runtime.command_retries,
        );
        let wg = Arc::new(WgQuick::new(runner.clone(), config.paths.wireguard_dir.clone()));

        Self {
            link: wg.clone(),
            peers: wg,
            filter: Arc::new(Iptables::new(runner.clone(), config.runtime.iptables.clone())),
            routing: Arc::new(RoutingController::new(
                runner,
                config.runtime.fallback_egress.clone(),
            )),
        }
    }
}

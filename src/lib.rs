//! wgpanel - WireGuard panel library
//!
//! Keeps a persisted description of WireGuard servers and clients in sync
//! with the host:
//! - Address, port and interface-name allocation
//! - Interface lifecycle through wg-quick
//! - Peer sets through wg
//! - NAT, forwarding and port-forward rules through iptables
//! - Live counter polling
//!
//! The host is reached only through the traits in [`control`], so the
//! reconciliation logic runs unchanged against an in-memory host.

pub mod error;
pub mod config;
pub mod model;
pub mod validation;
pub mod allocator;
pub mod command;
pub mod control;
pub mod routing;
pub mod keys;
pub mod artifact;
pub mod firewall;
pub mod peers;
pub mod reconcile;
pub mod store;
pub mod manager;
pub mod telemetry;
pub mod pidfile;

// Re-export commonly used types
pub use error::{PanelError, PanelResult};
pub use config::PanelConfig;
pub use model::{Client, PeerCounters, PortForward, Protocol, Server, Snapshot};
pub use control::{FilterRule, Host, LinkControl, PacketFilter, PeerControl, Routing};
pub use firewall::FirewallEngine;
pub use peers::{PeerReconciler, PeerSyncReport};
pub use reconcile::{ConvergeReport, Reconciler};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use manager::{ClientProfile, NewServer, PanelManager, ServerUpdate};
pub use telemetry::{PollReport, TelemetryPoller};
pub use pidfile::PidFile;

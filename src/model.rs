//! Desired-state data model
//!
//! The snapshot is the single source of truth consumed by the reconciler.
//! Field names follow the on-disk JSON layout of the panel database.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{PanelError, PanelResult};

/// A WireGuard server (one kernel interface)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    /// Kernel interface name, stable for the lifetime of the server
    pub interface: String,
    pub private_key: String,
    pub public_key: String,
    /// Server address inside its subnet, e.g. `10.0.0.1/24`
    pub address: Ipv4Net,
    pub listen_port: u16,
    pub dns: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub post_down: String,
    /// Host octet handed to the next client
    pub next_client_ip: u32,
}

impl Server {
    /// Network the server masquerades, e.g. `10.0.0.0/24`
    pub fn network(&self) -> Ipv4Net {
        self.address.trunc()
    }

    /// First two octets, the uniqueness key across servers
    pub fn prefix(&self) -> [u8; 2] {
        let octets = self.address.addr().octets();
        [octets[0], octets[1]]
    }
}

/// Transport selector of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    /// Concrete transports this selector expands to
    pub fn transports(self) -> &'static [Protocol] {
        match self {
            Protocol::Tcp => &[Protocol::Tcp],
            Protocol::Udp => &[Protocol::Udp],
            Protocol::Both => &[Protocol::Tcp, Protocol::Udp],
        }
    }

    /// Whether two claims on the same port collide
    pub fn conflicts_with(self, other: Protocol) -> bool {
        self == Protocol::Both || other == Protocol::Both || self == other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PanelError;

    fn from_str(s: &str) -> PanelResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(PanelError::InvalidParameter(format!(
                "Protocol must be tcp, udp or both (got '{}')",
                other
            ))),
        }
    }
}

/// A port published on the egress interface and redirected to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub description: String,
}

/// A peer of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    /// Host address inside the owning server's subnet (implicitly /32)
    pub address: Ipv4Addr,
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default, deserialize_with = "handshake_or_none")]
    pub last_handshake: Option<DateTime<Utc>>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub port_forwards: Vec<PortForward>,
}

/// Older databases store an empty forward list as `null`
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A handshake at or before the epoch (`0001-01-01T00:00:00Z`) means none happened
fn handshake_or_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let ts = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(ts.filter(|t| t.timestamp() > 0))
}

impl Client {
    /// Allowed-IPs entry for the peer
    pub fn allowed_ip(&self) -> String {
        format!("{}/32", self.address)
    }
}

/// Live counters for one peer, as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCounters {
    pub public_key: String,
    pub endpoint: Option<String>,
    /// Seconds since the epoch; zero when no handshake happened yet
    pub last_handshake: i64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// The ordered collection of servers and clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl Snapshot {
    pub fn server(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    pub fn server_index(&self, id: &str) -> PanelResult<usize> {
        self.servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| PanelError::NotFound(format!("Server {} not found", id)))
    }

    pub fn client_index(&self, id: &str) -> PanelResult<usize> {
        self.clients
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| PanelError::NotFound(format!("Client {} not found", id)))
    }

    pub fn server_by_interface(&self, interface: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.interface == interface)
    }

    /// Clients of one server, in snapshot order
    pub fn clients_of(&self, server_id: &str) -> Vec<Client> {
        self.clients
            .iter()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Merge live counters into the clients of `server_id`, matched by key.
    /// Returns how many clients were updated.
    pub fn merge_counters(&mut self, server_id: &str, counters: &[PeerCounters]) -> usize {
        let mut merged = 0;
        for peer in counters {
            let Some(client) = self
                .clients
                .iter_mut()
                .find(|c| c.server_id == server_id && c.public_key == peer.public_key)
            else {
                continue;
            };

            client.rx_bytes = peer.rx_bytes;
            client.tx_bytes = peer.tx_bytes;
            if let Some(endpoint) = &peer.endpoint {
                client.endpoint = endpoint.clone();
            }
            if peer.last_handshake > 0 {
                if let Some(ts) = DateTime::from_timestamp(peer.last_handshake, 0) {
                    client.last_handshake = Some(ts);
                }
            }
            merged += 1;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server {
            id: "s1".into(),
            name: "main".into(),
            interface: "wg0".into(),
            private_key: "priv".into(),
            public_key: "pub".into(),
            address: "10.0.0.1/24".parse().unwrap(),
            listen_port: 51000,
            dns: "1.1.1.1".into(),
            enabled: true,
            created_at: Utc::now(),
            post_up: String::new(),
            post_down: String::new(),
            next_client_ip: 2,
        }
    }

    fn client(id: &str, key: &str) -> Client {
        Client {
            id: id.into(),
            server_id: "s1".into(),
            name: id.into(),
            public_key: key.into(),
            private_key: "cpriv".into(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            enabled: true,
            comment: String::new(),
            created_at: Utc::now(),
            rx_bytes: 0,
            tx_bytes: 0,
            last_handshake: None,
            endpoint: String::new(),
            port_forwards: Vec::new(),
        }
    }

    #[test]
    fn test_server_network_and_prefix() {
        let s = server();
        assert_eq!(s.network().to_string(), "10.0.0.0/24");
        assert_eq!(s.prefix(), [10, 0]);
    }

    #[test]
    fn test_protocol_conflicts() {
        assert!(Protocol::Tcp.conflicts_with(Protocol::Tcp));
        assert!(!Protocol::Tcp.conflicts_with(Protocol::Udp));
        assert!(Protocol::Both.conflicts_with(Protocol::Udp));
        assert!(Protocol::Udp.conflicts_with(Protocol::Both));
        assert_eq!(Protocol::Both.transports(), &[Protocol::Tcp, Protocol::Udp]);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_snapshot_json_layout() {
        let mut snap = Snapshot::default();
        snap.servers.push(server());
        let mut c = client("c1", "k1");
        c.port_forwards.push(PortForward {
            port: 8080,
            protocol: Protocol::Both,
            description: "web".into(),
        });
        snap.clients.push(c);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["servers"][0]["address"], "10.0.0.1/24");
        assert_eq!(json["clients"][0]["address"], "10.0.0.2");
        assert_eq!(json["clients"][0]["port_forwards"][0]["protocol"], "both");

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_loads_database_with_null_forwards_and_zero_handshake() {
        let json = r#"{
          "servers": [{
            "id": "5f0c1b2e-6a8e-4d1f-9a57-2f1f4c9b7d10",
            "name": "home",
            "interface": "wg0",
            "private_key": "cHJpdmF0ZS1rZXktcGxhY2Vob2xkZXItMzItYnl0ZXM=",
            "public_key": "cHVibGljLWtleS1wbGFjZWhvbGRlci0zMi1ieXRlcyE=",
            "address": "10.0.0.1/24",
            "listen_port": 51000,
            "dns": "1.1.1.1",
            "enabled": true,
            "created_at": "2024-03-01T10:15:00.123456789Z",
            "post_up": "",
            "post_down": "",
            "next_client_ip": 3
          }],
          "clients": [{
            "id": "c1",
            "server_id": "5f0c1b2e-6a8e-4d1f-9a57-2f1f4c9b7d10",
            "name": "laptop",
            "public_key": "k1",
            "private_key": "p1",
            "address": "10.0.0.2",
            "enabled": true,
            "comment": "",
            "created_at": "2024-03-01T10:16:00Z",
            "rx_bytes": 0,
            "tx_bytes": 0,
            "last_handshake": "0001-01-01T00:00:00Z",
            "endpoint": "",
            "port_forwards": null
          }]
        }"#;

        let snap: Snapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.servers[0].network().to_string(), "10.0.0.0/24");
        assert_eq!(snap.clients[0].address, Ipv4Addr::new(10, 0, 0, 2));
        assert!(snap.clients[0].port_forwards.is_empty());
        assert!(snap.clients[0].last_handshake.is_none());

        // Written back, the list is an array and the handshake is null
        let back = serde_json::to_value(&snap).unwrap();
        assert_eq!(back["clients"][0]["port_forwards"], serde_json::json!([]));
        assert!(back["clients"][0]["last_handshake"].is_null());
    }

    #[test]
    fn test_real_handshake_is_kept() {
        let mut c = serde_json::to_value(client("c1", "k1")).unwrap();
        c["last_handshake"] = serde_json::json!("2024-03-01T10:20:00Z");
        let parsed: Client = serde_json::from_value(c).unwrap();
        assert_eq!(parsed.last_handshake.unwrap().timestamp(), 1_709_288_400);
    }

    #[test]
    fn test_merge_counters_matches_by_key_within_server() {
        let mut snap = Snapshot::default();
        snap.servers.push(server());
        snap.clients.push(client("c1", "k1"));
        let mut other = client("c2", "k2");
        other.server_id = "s2".into();
        snap.clients.push(other);

        let counters = vec![
            PeerCounters {
                public_key: "k1".into(),
                endpoint: Some("203.0.113.5:40000".into()),
                last_handshake: 1_700_000_000,
                rx_bytes: 100,
                tx_bytes: 200,
            },
            PeerCounters {
                public_key: "k2".into(),
                endpoint: None,
                last_handshake: 0,
                rx_bytes: 5,
                tx_bytes: 5,
            },
        ];

        assert_eq!(snap.merge_counters("s1", &counters), 1);
        let c1 = &snap.clients[0];
        assert_eq!(c1.rx_bytes, 100);
        assert_eq!(c1.tx_bytes, 200);
        assert_eq!(c1.endpoint, "203.0.113.5:40000");
        assert_eq!(c1.last_handshake.unwrap().timestamp(), 1_700_000_000);
        // k2 belongs to another server
        assert_eq!(snap.clients[1].rx_bytes, 0);
    }
}

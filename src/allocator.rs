//! Address, port and interface-name allocation
//!
//! Pure functions over the snapshot. Scans run in ascending order and report
//! [`PanelError::Exhausted`] instead of handing out a colliding default.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{PanelError, PanelResult};
use crate::model::{Client, Protocol, Server, Snapshot};

/// First octets tried for new server subnets (`N.0.0.1/24`)
pub const SUBNET_FIRST_OCTETS: std::ops::RangeInclusive<u8> = 10..=254;

/// Listen ports tried for new servers
pub const LISTEN_PORTS: std::ops::Range<u16> = 50000..65535;

/// Host octets handed to clients; .1 belongs to the server
pub const CLIENT_HOST_OCTETS: std::ops::RangeInclusive<u32> = 2..=254;

/// Prefix of kernel interface names
pub const INTERFACE_PREFIX: &str = "wg";

/// Whether no server (other than `exclude`) already uses the first two octets of `address`
pub fn is_subnet_available(snapshot: &Snapshot, address: &Ipv4Net, exclude: Option<&str>) -> bool {
    let octets = address.addr().octets();
    let prefix = [octets[0], octets[1]];
    !snapshot
        .servers
        .iter()
        .filter(|s| Some(s.id.as_str()) != exclude)
        .any(|s| s.prefix() == prefix)
}

/// Whether no server (other than `exclude`) listens on `port`
pub fn is_listen_port_available(snapshot: &Snapshot, port: u16, exclude: Option<&str>) -> bool {
    !snapshot
        .servers
        .iter()
        .filter(|s| Some(s.id.as_str()) != exclude)
        .any(|s| s.listen_port == port)
}

/// First free `N.0.0.1/24` subnet
pub fn next_available_subnet(snapshot: &Snapshot) -> PanelResult<Ipv4Net> {
    for first in SUBNET_FIRST_OCTETS {
        let candidate = Ipv4Net::new(Ipv4Addr::new(first, 0, 0, 1), 24)
            .map_err(|e| PanelError::ParseError(e.to_string()))?;
        if is_subnet_available(snapshot, &candidate, None) {
            return Ok(candidate);
        }
    }
    Err(PanelError::Exhausted("no free /24 subnet left".to_string()))
}

/// First listen port not claimed by any server
pub fn next_available_port(snapshot: &Snapshot) -> PanelResult<u16> {
    LISTEN_PORTS
        .into_iter()
        .find(|port| is_listen_port_available(snapshot, *port, None))
        .ok_or_else(|| PanelError::Exhausted("no free listen port left".to_string()))
}

/// Allocate the next client address of `server` and advance its counter.
///
/// Addresses already held by `clients` of the same server are skipped. The
/// caller must persist `server` afterwards or the counter advance is lost.
pub fn next_client_address(server: &mut Server, clients: &[Client]) -> PanelResult<Ipv4Addr> {
    let taken: HashSet<Ipv4Addr> = clients
        .iter()
        .filter(|c| c.server_id == server.id)
        .map(|c| c.address)
        .collect();
    let [a, b, c, _] = server.address.addr().octets();

    let mut host = server.next_client_ip.max(*CLIENT_HOST_OCTETS.start());
    while CLIENT_HOST_OCTETS.contains(&host) {
        let candidate = Ipv4Addr::new(a, b, c, host as u8);
        host += 1;
        if !taken.contains(&candidate) && candidate != server.address.addr() {
            server.next_client_ip = host;
            return Ok(candidate);
        }
    }

    Err(PanelError::Exhausted(format!(
        "no free client address left in {}",
        server.network()
    )))
}

/// Move a lagging counter past the highest host octet already allocated
pub fn resync_client_counter(server: &mut Server, clients: &[Client]) -> bool {
    let highest = clients
        .iter()
        .filter(|c| c.server_id == server.id)
        .map(|c| c.address.octets()[3] as u32)
        .max()
        .unwrap_or(1);

    if server.next_client_ip <= highest {
        server.next_client_ip = highest + 1;
        true
    } else {
        false
    }
}

/// Whether `port`/`protocol` can be forwarded without colliding with any
/// existing forward of any client
pub fn is_port_forward_available(snapshot: &Snapshot, port: u16, protocol: Protocol) -> bool {
    !snapshot
        .clients
        .iter()
        .flat_map(|c| c.port_forwards.iter())
        .any(|pf| pf.port == port && pf.protocol.conflicts_with(protocol))
}

/// Smallest `wgN` not used by a server, a live interface or a leftover config
pub fn next_interface_name(
    snapshot: &Snapshot,
    live: &[String],
    artifacts: &[String],
) -> PanelResult<String> {
    let used: HashSet<&str> = snapshot
        .servers
        .iter()
        .map(|s| s.interface.as_str())
        .chain(live.iter().map(String::as_str))
        .chain(artifacts.iter().map(String::as_str))
        .collect();

    (0..10_000u32)
        .map(|n| format!("{}{}", INTERFACE_PREFIX, n))
        .find(|name| !used.contains(name.as_str()))
        .ok_or_else(|| PanelError::Exhausted("no free interface name left".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PortForward;
    use chrono::Utc;

    fn server(id: &str, address: &str, port: u16, interface: &str) -> Server {
        Server {
            id: id.into(),
            name: id.into(),
            interface: interface.into(),
            private_key: String::new(),
            public_key: String::new(),
            address: address.parse().unwrap(),
            listen_port: port,
            dns: String::new(),
            enabled: true,
            created_at: Utc::now(),
            post_up: String::new(),
            post_down: String::new(),
            next_client_ip: 2,
        }
    }

    fn client(server_id: &str, address: Ipv4Addr) -> Client {
        Client {
            id: format!("c-{}", address),
            server_id: server_id.into(),
            name: "c".into(),
            public_key: format!("pk-{}", address),
            private_key: String::new(),
            address,
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
    fn test_next_subnet_skips_used_prefixes() {
        let mut snap = Snapshot::default();
        assert_eq!(next_available_subnet(&snap).unwrap().to_string(), "10.0.0.1/24");

        snap.servers.push(server("a", "10.0.0.1/24", 50000, "wg0"));
        snap.servers.push(server("b", "11.0.5.1/24", 50001, "wg1"));
        assert_eq!(next_available_subnet(&snap).unwrap().to_string(), "12.0.0.1/24");
    }

    #[test]
    fn test_subnet_exhaustion_is_an_error() {
        let mut snap = Snapshot::default();
        for (i, first) in SUBNET_FIRST_OCTETS.enumerate() {
            snap.servers.push(server(
                &format!("s{}", i),
                &format!("{}.0.0.1/24", first),
                50000 + i as u16,
                &format!("wg{}", i),
            ));
        }
        assert!(matches!(next_available_subnet(&snap), Err(PanelError::Exhausted(_))));
    }

    #[test]
    fn test_subnet_uniqueness_uses_first_two_octets() {
        let mut snap = Snapshot::default();
        snap.servers.push(server("a", "10.0.0.1/24", 50000, "wg0"));

        assert!(!is_subnet_available(&snap, &"10.0.7.1/24".parse().unwrap(), None));
        assert!(is_subnet_available(&snap, &"10.1.0.1/24".parse().unwrap(), None));
        assert!(is_subnet_available(&snap, &"10.0.7.1/24".parse().unwrap(), Some("a")));
    }

    #[test]
    fn test_next_port() {
        let mut snap = Snapshot::default();
        assert_eq!(next_available_port(&snap).unwrap(), 50000);
        snap.servers.push(server("a", "10.0.0.1/24", 50000, "wg0"));
        snap.servers.push(server("b", "11.0.0.1/24", 50002, "wg1"));
        assert_eq!(next_available_port(&snap).unwrap(), 50001);
        assert!(!is_listen_port_available(&snap, 50002, None));
        assert!(is_listen_port_available(&snap, 50002, Some("b")));
    }

    #[test]
    fn test_sequential_client_addresses() {
        let mut srv = server("a", "10.0.0.1/24", 50000, "wg0");
        let mut clients = Vec::new();
        for _ in 0..5 {
            let addr = next_client_address(&mut srv, &clients).unwrap();
            clients.push(client("a", addr));
        }

        let got: Vec<String> = clients.iter().map(|c| c.address.to_string()).collect();
        assert_eq!(got, vec!["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]);
        assert_eq!(srv.next_client_ip, 7);
    }

    #[test]
    fn test_client_address_skips_taken_and_exhausts() {
        let mut srv = server("a", "10.0.0.1/24", 50000, "wg0");
        let clients = vec![client("a", Ipv4Addr::new(10, 0, 0, 2))];
        assert_eq!(next_client_address(&mut srv, &clients).unwrap(), Ipv4Addr::new(10, 0, 0, 3));

        srv.next_client_ip = 254;
        assert_eq!(next_client_address(&mut srv, &[]).unwrap(), Ipv4Addr::new(10, 0, 0, 254));
        assert!(matches!(next_client_address(&mut srv, &[]), Err(PanelError::Exhausted(_))));
    }

    #[test]
    fn test_resync_client_counter() {
        let mut srv = server("a", "10.0.0.1/24", 50000, "wg0");
        let clients = vec![
            client("a", Ipv4Addr::new(10, 0, 0, 9)),
            client("b", Ipv4Addr::new(11, 0, 0, 40)),
        ];
        assert!(resync_client_counter(&mut srv, &clients));
        assert_eq!(srv.next_client_ip, 10);
        assert!(!resync_client_counter(&mut srv, &clients));
    }

    #[test]
    fn test_port_forward_conflicts() {
        let mut snap = Snapshot::default();
        let mut c = client("a", Ipv4Addr::new(10, 0, 0, 2));
        c.port_forwards.push(PortForward {
            port: 51000,
            protocol: Protocol::Tcp,
            description: String::new(),
        });
        snap.clients.push(c);

        assert!(!is_port_forward_available(&snap, 51000, Protocol::Both));
        assert!(is_port_forward_available(&snap, 51000, Protocol::Udp));
        assert!(!is_port_forward_available(&snap, 51000, Protocol::Tcp));
        assert!(is_port_forward_available(&snap, 51001, Protocol::Both));
    }

    #[test]
    fn test_port_forward_conflicts_are_global() {
        let mut snap = Snapshot::default();
        let mut c = client("other-server", Ipv4Addr::new(11, 0, 0, 2));
        c.port_forwards.push(PortForward {
            port: 8080,
            protocol: Protocol::Both,
            description: String::new(),
        });
        snap.clients.push(c);

        assert!(!is_port_forward_available(&snap, 8080, Protocol::Udp));
        assert!(!is_port_forward_available(&snap, 8080, Protocol::Tcp));
    }

    #[test]
    fn test_interface_names_avoid_every_trace() {
        let mut snap = Snapshot::default();
        snap.servers.push(server("a", "10.0.0.1/24", 50000, "wg1"));

        let live = vec!["wg0".to_string()];
        let artifacts = vec!["wg2".to_string()];
        assert_eq!(next_interface_name(&snap, &live, &artifacts).unwrap(), "wg3");
        assert_eq!(next_interface_name(&Snapshot::default(), &[], &[]).unwrap(), "wg0");
    }
}

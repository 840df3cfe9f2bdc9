//! WireGuard config file rendering
//!
//! The server artifact is what `wg-quick up` reads; the client profile is
//! the file a user imports on their device.

use std::fmt::Write as _;

use crate::model::{Client, Server};

/// Render `<interface>.conf` for a server and its enabled clients
pub fn render_server_config(server: &Server, clients: &[Client]) -> String {
    let mut cfg = String::new();

    // [Interface] section
    cfg.push_str("[Interface]\n");
    let _ = writeln!(cfg, "PrivateKey = {}", server.private_key);
    let _ = writeln!(cfg, "Address = {}", server.address);
    let _ = writeln!(cfg, "ListenPort = {}", server.listen_port);
    if !server.post_up.trim().is_empty() {
        let _ = writeln!(cfg, "PostUp = {}", server.post_up.trim());
    }
    if !server.post_down.trim().is_empty() {
        let _ = writeln!(cfg, "PostDown = {}", server.post_down.trim());
    }

    // [Peer] sections
    for client in clients
        .iter()
        .filter(|c| c.server_id == server.id && c.enabled)
    {
        cfg.push_str("\n[Peer]\n");
        let _ = writeln!(cfg, "PublicKey = {}", client.public_key);
        let _ = writeln!(cfg, "AllowedIPs = {}", client.allowed_ip());
    }

    cfg
}

/// Render the profile a client imports
pub fn render_client_config(
    client: &Client,
    server: &Server,
    endpoint: &str,
    keepalive: u16,
) -> String {
    let mut cfg = String::new();

    cfg.push_str("[Interface]\n");
    let _ = writeln!(cfg, "PrivateKey = {}", client.private_key);
    let _ = writeln!(cfg, "Address = {}", client.allowed_ip());
    if !server.dns.is_empty() {
        let _ = writeln!(cfg, "DNS = {}", server.dns);
    }

    cfg.push_str("\n[Peer]\n");
    let _ = writeln!(cfg, "PublicKey = {}", server.public_key);
    let _ = writeln!(cfg, "Endpoint = {}:{}", endpoint, server.listen_port);
    cfg.push_str("AllowedIPs = 0.0.0.0/0\n");
    if keepalive > 0 {
        let _ = writeln!(cfg, "PersistentKeepalive = {}", keepalive);
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn server() -> Server {
        Server {
            id: "s1".into(),
            name: "main".into(),
            interface: "wg0".into(),
            private_key: "SPRIV".into(),
            public_key: "SPUB".into(),
            address: "10.0.0.1/24".parse().unwrap(),
            listen_port: 51000,
            dns: "1.1.1.1".into(),
            enabled: true,
            created_at: Utc::now(),
            post_up: String::new(),
            post_down: String::new(),
            next_client_ip: 4,
        }
    }

    fn client(id: &str, octet: u8, enabled: bool) -> Client {
        Client {
            id: id.into(),
            server_id: "s1".into(),
            name: id.into(),
            public_key: format!("PUB-{}", id),
            private_key: format!("PRIV-{}", id),
            address: Ipv4Addr::new(10, 0, 0, octet),
            enabled,
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
    fn test_server_config_lists_enabled_peers_only() {
        let mut other = client("x", 9, true);
        other.server_id = "s2".into();
        let clients = vec![client("a", 2, true), client("b", 3, false), other];

        let cfg = render_server_config(&server(), &clients);
        assert_eq!(
            cfg,
            "[Interface]\n\
             PrivateKey = SPRIV\n\
             Address = 10.0.0.1/24\n\
             ListenPort = 51000\n\
             \n\
             [Peer]\n\
             PublicKey = PUB-a\n\
             AllowedIPs = 10.0.0.2/32\n"
        );
    }

    #[test]
    fn test_server_config_hooks() {
        let mut srv = server();
        srv.post_up = "echo up".into();
        let cfg = render_server_config(&srv, &[]);
        assert!(cfg.contains("PostUp = echo up\n"));
        assert!(!cfg.contains("PostDown"));
    }

    #[test]
    fn test_client_config() {
        let cfg = render_client_config(&client("a", 2, true), &server(), "vpn.example.org", 10);
        assert_eq!(
            cfg,
            "[Interface]\n\
             PrivateKey = PRIV-a\n\
             Address = 10.0.0.2/32\n\
             DNS = 1.1.1.1\n\
             \n\
             [Peer]\n\
             PublicKey = SPUB\n\
             Endpoint = vpn.example.org:51000\n\
             AllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = 10\n"
        );
    }
}

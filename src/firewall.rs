//! Firewall rule engine
//!
//! Translates servers and port forwards into packet filter rules. Insertion
//! is check-then-insert, so applying the same rules twice leaves one copy.
//! Removal is best effort and never fails the caller.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::control::{FilterRule, PacketFilter, Routing};
use crate::error::PanelResult;
use crate::model::{Client, PortForward, Server};

/// Upper bound on deletions of one rule, for copies left by blind inserts
const MAX_DUPLICATE_DELETES: usize = 16;

#[derive(Clone)]
pub struct FirewallEngine {
    filter: Arc<dyn PacketFilter>,
    routing: Arc<dyn Routing>,
}

impl FirewallEngine {
    pub fn new(filter: Arc<dyn PacketFilter>, routing: Arc<dyn Routing>) -> Self {
        Self { filter, routing }
    }

    /// Forward-accept in both directions plus masquerade of the subnet
    pub fn server_rules(server: &Server, egress: &str) -> Vec<FilterRule> {
        vec![
            FilterRule::ForwardIn { interface: server.interface.clone() },
            FilterRule::ForwardOut { interface: server.interface.clone() },
            FilterRule::Masquerade {
                network: server.network(),
                egress: egress.to_string(),
            },
        ]
    }

    /// Redirect + accept pair per transport of `forward`
    pub fn forward_rules(client: &Client, forward: &PortForward, egress: &str) -> Vec<FilterRule> {
        forward
            .protocol
            .transports()
            .iter()
            .flat_map(|protocol| {
                [
                    FilterRule::PortRedirect {
                        egress: egress.to_string(),
                        protocol: *protocol,
                        port: forward.port,
                        destination: client.address,
                    },
                    FilterRule::PortAccept {
                        protocol: *protocol,
                        port: forward.port,
                        destination: client.address,
                    },
                ]
            })
            .collect()
    }

    pub async fn apply_server_rules(&self, server: &Server) -> PanelResult<()> {
        let egress = self.routing.default_egress_interface().await;
        for rule in Self::server_rules(server, &egress) {
            self.ensure(&rule).await?;
        }
        debug!("Server rules in place for {}", server.interface);
        Ok(())
    }

    pub async fn remove_server_rules(&self, server: &Server) {
        let egress = self.routing.default_egress_interface().await;
        for rule in Self::server_rules(server, &egress) {
            self.remove(&rule).await;
        }
    }

    /// Remove the forward-accept rules of an interface no server owns.
    /// Its masquerade rule cannot be derived without the subnet and stays.
    pub async fn remove_interface_rules(&self, interface: &str) {
        for rule in [
            FilterRule::ForwardIn { interface: interface.to_string() },
            FilterRule::ForwardOut { interface: interface.to_string() },
        ] {
            self.remove(&rule).await;
        }
    }

    /// Apply one forward; stops at the first failing rule
    pub async fn apply_port_forward(
        &self,
        client: &Client,
        forward: &PortForward,
    ) -> PanelResult<()> {
        let egress = self.routing.default_egress_interface().await;
        for rule in Self::forward_rules(client, forward, &egress) {
            self.ensure(&rule).await?;
        }
        debug!(
            "Port forward {}/{} -> {} in place",
            forward.port, forward.protocol, client.address
        );
        Ok(())
    }

    pub async fn remove_port_forward(&self, client: &Client, forward: &PortForward) {
        let egress = self.routing.default_egress_interface().await;
        for rule in Self::forward_rules(client, forward, &egress) {
            self.remove(&rule).await;
        }
    }

    /// Apply every forward of `client`; failures are logged per forward.
    /// Returns how many forwards failed.
    pub async fn apply_client_forwards(&self, client: &Client) -> usize {
        let mut failed = 0;
        for forward in &client.port_forwards {
            if let Err(e) = self.apply_port_forward(client, forward).await {
                warn!(
                    "Failed to apply port forward {}/{} for client {}: {}",
                    forward.port, forward.protocol, client.name, e
                );
                failed += 1;
            }
        }
        failed
    }

    pub async fn remove_client_forwards(&self, client: &Client) {
        for forward in &client.port_forwards {
            self.remove_port_forward(client, forward).await;
        }
    }

    async fn ensure(&self, rule: &FilterRule) -> PanelResult<()> {
        if self.filter.exists(rule).await? {
            debug!("Rule already present: {}", rule);
            return Ok(());
        }
        self.filter.insert(rule).await
    }

    async fn remove(&self, rule: &FilterRule) {
        for _ in 0..MAX_DUPLICATE_DELETES {
            match self.filter.exists(rule).await {
                Ok(true) => {
                    if let Err(e) = self.filter.delete(rule).await {
                        debug!("Ignoring failed delete of {}: {}", rule, e);
                        return;
                    }
                }
                Ok(false) => return,
                Err(e) => {
                    debug!("Ignoring failed check of {}: {}", rule, e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MockRouting;
    use crate::error::PanelError;
    use crate::model::Protocol;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RuleTable {
        rules: Mutex<Vec<FilterRule>>,
        fail_on: Mutex<Option<FilterRule>>,
    }

    #[async_trait]
    impl PacketFilter for RuleTable {
        async fn exists(&self, rule: &FilterRule) -> PanelResult<bool> {
            Ok(self.rules.lock().unwrap().contains(rule))
        }

        async fn insert(&self, rule: &FilterRule) -> PanelResult<()> {
            if self.fail_on.lock().unwrap().as_ref() == Some(rule) {
                return Err(PanelError::CommandFailed {
                    cmd: "iptables".into(),
                    code: Some(1),
                    stderr: "rejected".into(),
                });
            }
            self.rules.lock().unwrap().push(rule.clone());
            Ok(())
        }

        async fn delete(&self, rule: &FilterRule) -> PanelResult<()> {
            let mut rules = self.rules.lock().unwrap();
            if let Some(pos) = rules.iter().position(|r| r == rule) {
                rules.remove(pos);
            }
            Ok(())
        }
    }

    fn routing() -> Arc<MockRouting> {
        let mut routing = MockRouting::new();
        routing
            .expect_default_egress_interface()
            .returning(|| "eth0".to_string());
        Arc::new(routing)
    }

    fn server() -> Server {
        Server {
            id: "s1".into(),
            name: "main".into(),
            interface: "wg0".into(),
            private_key: String::new(),
            public_key: String::new(),
            address: "10.0.0.1/24".parse().unwrap(),
            listen_port: 51000,
            dns: String::new(),
            enabled: true,
            created_at: Utc::now(),
            post_up: String::new(),
            post_down: String::new(),
            next_client_ip: 2,
        }
    }

    fn client() -> Client {
        Client {
            id: "c1".into(),
            server_id: "s1".into(),
            name: "laptop".into(),
            public_key: String::new(),
            private_key: String::new(),
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

    #[tokio::test]
    async fn test_server_rules_are_idempotent() {
        let table = Arc::new(RuleTable::default());
        let engine = FirewallEngine::new(table.clone(), routing());

        engine.apply_server_rules(&server()).await.unwrap();
        engine.apply_server_rules(&server()).await.unwrap();

        let rules = table.rules.lock().unwrap().clone();
        assert_eq!(rules.len(), 3);
        assert!(rules.contains(&FilterRule::Masquerade {
            network: "10.0.0.0/24".parse().unwrap(),
            egress: "eth0".into(),
        }));
    }

    #[tokio::test]
    async fn test_remove_server_rules_clears_duplicates() {
        let table = Arc::new(RuleTable::default());
        let rule = FilterRule::ForwardIn { interface: "wg0".into() };
        table.rules.lock().unwrap().extend([rule.clone(), rule.clone()]);

        let engine = FirewallEngine::new(table.clone(), routing());
        engine.remove_server_rules(&server()).await;
        assert!(table.rules.lock().unwrap().is_empty());

        // Nothing present is fine too
        engine.remove_server_rules(&server()).await;
    }

    #[tokio::test]
    async fn test_both_expands_to_two_pairs() {
        let table = Arc::new(RuleTable::default());
        let engine = FirewallEngine::new(table.clone(), routing());
        let forward = PortForward {
            port: 8080,
            protocol: Protocol::Both,
            description: String::new(),
        };

        engine.apply_port_forward(&client(), &forward).await.unwrap();
        assert_eq!(table.rules.lock().unwrap().len(), 4);

        engine.remove_port_forward(&client(), &forward).await;
        assert!(table.rules.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_port_forward_fails_fast() {
        let table = Arc::new(RuleTable::default());
        *table.fail_on.lock().unwrap() = Some(FilterRule::PortAccept {
            protocol: Protocol::Tcp,
            port: 8080,
            destination: Ipv4Addr::new(10, 0, 0, 2),
        });
        let engine = FirewallEngine::new(table.clone(), routing());
        let forward = PortForward {
            port: 8080,
            protocol: Protocol::Both,
            description: String::new(),
        };

        assert!(engine.apply_port_forward(&client(), &forward).await.is_err());
        // Only the tcp redirect made it in; udp was never attempted
        assert_eq!(table.rules.lock().unwrap().len(), 1);
    }
}

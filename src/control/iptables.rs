//! iptables backed packet filter

use async_trait::async_trait;
use tracing::debug;

use super::{FilterRule, PacketFilter};
use crate::command::CommandRunner;
use crate::error::PanelResult;

/// Where a rule is placed when inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Top of the chain, ahead of any distribution default policy rules
    Head,
    Append,
}

/// Table, chain and match/target arguments of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
struct RuleArgs {
    table: &'static str,
    chain: &'static str,
    placement: Placement,
    matches: Vec<String>,
}

fn rule_args(rule: &FilterRule) -> RuleArgs {
    let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match rule {
        FilterRule::ForwardIn { interface } => RuleArgs {
            table: "filter",
            chain: "FORWARD",
            placement: Placement::Head,
            matches: owned(&["-i", interface.as_str(), "-j", "ACCEPT"]),
        },
        FilterRule::ForwardOut { interface } => RuleArgs {
            table: "filter",
            chain: "FORWARD",
            placement: Placement::Head,
            matches: owned(&["-o", interface.as_str(), "-j", "ACCEPT"]),
        },
        FilterRule::Masquerade { network, egress } => RuleArgs {
            table: "nat",
            chain: "POSTROUTING",
            placement: Placement::Append,
            matches: owned(&[
                "-s",
                &network.to_string(),
                "-o",
                egress.as_str(),
                "-j",
                "MASQUERADE",
            ]),
        },
        FilterRule::PortRedirect { egress, protocol, port, destination } => RuleArgs {
            table: "nat",
            chain: "PREROUTING",
            placement: Placement::Append,
            matches: owned(&[
                "-i",
                egress.as_str(),
                "-p",
                protocol.as_str(),
                "--dport",
                &port.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{}:{}", destination, port),
            ]),
        },
        FilterRule::PortAccept { protocol, port, destination } => RuleArgs {
            table: "filter",
            chain: "FORWARD",
            placement: Placement::Head,
            matches: owned(&[
                "-p",
                protocol.as_str(),
                "-d",
                &destination.to_string(),
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ]),
        },
    }
}

/// Full argument vector for one action on `rule`
fn command_args(rule: &FilterRule, action: &str) -> Vec<String> {
    let args = rule_args(rule);
    let mut out = vec!["-t".to_string(), args.table.to_string()];

    match (action, args.placement) {
        ("-I", Placement::Head) => {
            out.extend(["-I".to_string(), args.chain.to_string(), "1".to_string()]);
        }
        ("-I", Placement::Append) => {
            out.extend(["-A".to_string(), args.chain.to_string()]);
        }
        (action, _) => {
            out.extend([action.to_string(), args.chain.to_string()]);
        }
    }

    out.extend(args.matches);
    out
}

/// Packet filter driven through the `iptables` binary
pub struct Iptables {
    runner: CommandRunner,
    binary: String,
}

impl Iptables {
    pub fn new(runner: CommandRunner, binary: String) -> Self {
        Self { runner, binary }
    }
}

#[async_trait]
impl PacketFilter for Iptables {
    async fn exists(&self, rule: &FilterRule) -> PanelResult<bool> {
        let args = command_args(rule, "-C");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.succeeds(&self.binary, &args).await
    }

    async fn insert(&self, rule: &FilterRule) -> PanelResult<()> {
        let args = command_args(rule, "-I");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(&self.binary, &args).await?;
        debug!("Inserted rule: {}", rule);
        Ok(())
    }

    async fn delete(&self, rule: &FilterRule) -> PanelResult<()> {
        let args = command_args(rule, "-D");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(&self.binary, &args).await?;
        debug!("Deleted rule: {}", rule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use std::net::Ipv4Addr;

    fn joined(rule: &FilterRule, action: &str) -> String {
        command_args(rule, action).join(" ")
    }

    #[test]
    fn test_forward_rules_go_to_chain_head() {
        let rule = FilterRule::ForwardIn { interface: "wg0".into() };
        assert_eq!(joined(&rule, "-I"), "-t filter -I FORWARD 1 -i wg0 -j ACCEPT");
        assert_eq!(joined(&rule, "-C"), "-t filter -C FORWARD -i wg0 -j ACCEPT");
        assert_eq!(joined(&rule, "-D"), "-t filter -D FORWARD -i wg0 -j ACCEPT");

        let rule = FilterRule::ForwardOut { interface: "wg0".into() };
        assert_eq!(joined(&rule, "-I"), "-t filter -I FORWARD 1 -o wg0 -j ACCEPT");
    }

    #[test]
    fn test_masquerade_is_appended_to_nat() {
        let rule = FilterRule::Masquerade {
            network: "10.0.0.0/24".parse().unwrap(),
            egress: "eth0".into(),
        };
        assert_eq!(
            joined(&rule, "-I"),
            "-t nat -A POSTROUTING -s 10.0.0.0/24 -o eth0 -j MASQUERADE"
        );
        assert_eq!(
            joined(&rule, "-D"),
            "-t nat -D POSTROUTING -s 10.0.0.0/24 -o eth0 -j MASQUERADE"
        );
    }

    #[test]
    fn test_port_forward_rules() {
        let redirect = FilterRule::PortRedirect {
            egress: "eth0".into(),
            protocol: Protocol::Tcp,
            port: 8080,
            destination: Ipv4Addr::new(10, 0, 0, 2),
        };
        assert_eq!(
            joined(&redirect, "-I"),
            "-t nat -A PREROUTING -i eth0 -p tcp --dport 8080 -j DNAT --to-destination 10.0.0.2:8080"
        );

        let accept = FilterRule::PortAccept {
            protocol: Protocol::Udp,
            port: 8080,
            destination: Ipv4Addr::new(10, 0, 0, 2),
        };
        assert_eq!(
            joined(&accept, "-I"),
            "-t filter -I FORWARD 1 -p udp -d 10.0.0.2 --dport 8080 -j ACCEPT"
        );
        assert_eq!(
            joined(&accept, "-C"),
            "-t filter -C FORWARD -p udp -d 10.0.0.2 --dport 8080 -j ACCEPT"
        );
    }
}

//! Routing table queries

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::control::Routing;
use crate::error::PanelResult;

pub struct RoutingController {
    runner: CommandRunner,
    fallback: String,
}

impl RoutingController {
    pub fn new(runner: CommandRunner, fallback: String) -> Self {
        Self { runner, fallback }
    }
}

#[async_trait]
impl Routing for RoutingController {
    async fn default_egress_interface(&self) -> String {
        match self.runner.run("ip", &["-4", "route", "show", "default"]).await {
            Ok(output) => match parse_default_dev(&output) {
                Some(dev) => {
                    debug!("Default egress interface: {}", dev);
                    dev
                }
                None => {
                    warn!("No default route found, using {}", self.fallback);
                    self.fallback.clone()
                }
            },
            Err(e) => {
                warn!("Failed to query default route ({}), using {}", e, self.fallback);
                self.fallback.clone()
            }
        }
    }

    async fn enable_ip_forwarding(&self) -> PanelResult<()> {
        self.runner.run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
        info!("IPv4 forwarding enabled");
        Ok(())
    }
}

/// Device of the first default route in `ip route` output
pub fn parse_default_dev(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "dev")?;
            tokens.next().map(String::from)
        })
}

//! wg / wg-quick backed link and peer control

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{LinkControl, PeerControl};
use crate::command::CommandRunner;
use crate::error::{PanelError, PanelResult};
use crate::model::PeerCounters;
use crate::validation;

/// Drives interfaces through `wg-quick` and peers through `wg`.
///
/// Artifacts live at `<config_dir>/<interface>.conf`, which is where
/// `wg-quick up <interface>` looks for them.
pub struct WgQuick {
    runner: CommandRunner,
    config_dir: PathBuf,
}

impl WgQuick {
    pub fn new(runner: CommandRunner, config_dir: PathBuf) -> Self {
        Self { runner, config_dir }
    }

    fn artifact_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }

    /// Whether the `wg` and `wg-quick` tools are installed
    pub async fn is_available(&self) -> bool {
        self.runner.succeeds("which", &["wg"]).await.unwrap_or(false)
            && self.runner.succeeds("which", &["wg-quick"]).await.unwrap_or(false)
    }
}

#[async_trait]
impl LinkControl for WgQuick {
    async fn live_interfaces(&self) -> PanelResult<Vec<String>> {
        let output = self.runner.run("wg", &["show", "interfaces"]).await?;
        Ok(output.split_whitespace().map(String::from).collect())
    }

    async fn config_artifacts(&self) -> PanelResult<Vec<String>> {
        if !self.config_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.config_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn write_artifact(&self, interface: &str, content: &str) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        ensure_directory_exists(&self.config_dir).await?;
        write_secure_config(&self.artifact_path(interface), content, 0o600).await
    }

    async fn delete_artifact(&self, interface: &str) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        let path = self.artifact_path(interface);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            debug!("Deleted config file: {:?}", path);
        }
        Ok(())
    }

    async fn up(&self, interface: &str) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        self.runner.run("wg-quick", &["up", interface]).await?;
        info!("Interface {} is up", interface);
        Ok(())
    }

    async fn down(&self, interface: &str) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        self.runner.run("wg-quick", &["down", interface]).await?;
        info!("Interface {} is down", interface);
        Ok(())
    }
}

#[async_trait]
impl PeerControl for WgQuick {
    async fn peers(&self, interface: &str) -> PanelResult<Vec<String>> {
        validation::validate_interface_name(interface)?;
        let output = self.runner.run("wg", &["show", interface, "peers"]).await?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn add_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ip: &str,
    ) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        validation::validate_key(public_key)?;
        self.runner
            .run("wg", &["set", interface, "peer", public_key, "allowed-ips", allowed_ip])
            .await?;
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> PanelResult<()> {
        validation::validate_interface_name(interface)?;
        validation::validate_key(public_key)?;
        self.runner.run("wg", &["set", interface, "peer", public_key, "remove"]).await?;
        Ok(())
    }

    async fn dump(&self, interface: &str) -> PanelResult<Vec<PeerCounters>> {
        validation::validate_interface_name(interface)?;
        let output = self.runner.run("wg", &["show", interface, "dump"]).await?;
        Ok(parse_dump(&output))
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface itself. Every following line is a
/// peer: public key, preshared key, endpoint, allowed ips, latest handshake,
/// transfer rx, transfer tx, persistent keepalive (tab separated).
pub fn parse_dump(output: &str) -> Vec<PeerCounters> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 8 {
                return None;
            }

            let endpoint = match fields[2] {
                "(none)" | "" => None,
                ep => Some(ep.to_string()),
            };

            Some(PeerCounters {
                public_key: fields[0].to_string(),
                endpoint,
                last_handshake: fields[4].parse().unwrap_or(0),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Ensure a directory exists, creating it if necessary
async fn ensure_directory_exists(path: &Path) -> PanelResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| {
                PanelError::ConfigError(format!("Failed to create directory {:?}: {}", path, e))
            })?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write configuration to a file with restrictive permissions
async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> PanelResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, content).await?;

    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(path, perms).await?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

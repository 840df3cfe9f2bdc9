//! Configuration management for wgpanel

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{PanelError, PanelResult};

/// Where the daemon and CLI look for their config by default
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgpanel/wgpanel.toml";

/// Main wgpanel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// File and directory locations
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Daemon runtime behaviour
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Defaults used when exporting client profiles
    #[serde(default)]
    pub clients: ClientDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Desired-state snapshot (JSON)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Directory holding per-interface WireGuard configs
    #[serde(default = "default_wireguard_dir")]
    pub wireguard_dir: PathBuf,
    /// Process identity marker
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Telemetry poll interval (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound for every external command (seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Extra attempts after a command times out
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
    /// Egress interface used when default route discovery fails
    #[serde(default = "default_fallback_egress")]
    pub fallback_egress: String,
    /// Packet filter binary
    #[serde(default = "default_iptables")]
    pub iptables: String,
    /// Turn on net.ipv4.ip_forward before bringing interfaces up
    #[serde(default = "default_true")]
    pub manage_ip_forwarding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDefaults {
    /// DNS hint for new servers
    #[serde(default = "default_dns")]
    pub default_dns: String,
    /// Public host name or address of this machine
    #[serde(default)]
    pub endpoint: Option<String>,
    /// PersistentKeepalive written into client profiles
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/opt/wgpanel/db.json")
}

fn default_wireguard_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/wgpanel.pid")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    10
}

fn default_command_retries() -> u32 {
    1
}

fn default_fallback_egress() -> String {
    "eth0".to_string()
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_keepalive() -> u16 {
    10
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            wireguard_dir: default_wireguard_dir(),
            pid_file: default_pid_file(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            command_timeout_secs: default_command_timeout(),
            command_retries: default_command_retries(),
            fallback_egress: default_fallback_egress(),
            iptables: default_iptables(),
            manage_ip_forwarding: default_true(),
        }
    }
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            default_dns: default_dns(),
            endpoint: None,
            persistent_keepalive: default_keepalive(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            runtime: RuntimeSettings::default(),
            clients: ClientDefaults::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

impl PanelConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> PanelResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PanelError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| PanelError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> PanelResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PanelResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PanelError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| PanelError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure the state and WireGuard directories exist
    pub fn ensure_directories(&self) -> PanelResult<()> {
        let state_dir = self.paths.state_file.parent().map(Path::to_path_buf);
        for dir in state_dir.iter().chain(std::iter::once(&self.paths.wireguard_dir)) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            std::fs::create_dir_all(dir)
                .map_err(|e| {
                    PanelError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
        }
        Ok(())
    }
}

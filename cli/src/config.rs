// Configuration management for the alertmesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/alertmesh/config.json
// - Linux: ~/.config/alertmesh/config.json
// - Windows: %APPDATA%\alertmesh\config.json

use alertmesh_core::{DeviceInfo, IceServerConfig, MeshConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity this node announces to the mesh
    pub device: DeviceSettings,

    /// Timers, capacities, signaling and transport settings
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Stable device id, generated on first run
    pub id: String,

    /// Human-readable name shown to peers
    pub name: String,

    /// Free-form device class (mobile, desktop, gateway, ...)
    pub device_type: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            name: format!("node-{}", &id[..8]),
            id,
            device_type: "desktop".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("alertmesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return a fresh default
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Record announced by the mesh for this node
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(
            self.device.id.clone(),
            self.device.name.clone(),
            self.device.device_type.clone(),
        )
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory; the result must still validate
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "device_id" => {
                anyhow::ensure!(!value.trim().is_empty(), "device_id cannot be empty");
                next.device.id = value.to_string();
            }
            "device_name" => next.device.name = value.to_string(),
            "device_type" => next.device.device_type = value.to_string(),
            "signaling_url" => next.mesh.signaling.url = value.to_string(),
            "discovery_interval_ms" => {
                next.mesh.discovery_interval_ms = value.parse().context("Invalid number")?;
            }
            "heartbeat_interval_ms" => {
                next.mesh.heartbeat_interval_ms = value.parse().context("Invalid number")?;
            }
            "max_peers" => {
                next.mesh.max_peers = value.parse().context("Invalid number")?;
            }
            "max_hops" => {
                next.mesh.max_hops = value.parse().context("Invalid number")?;
            }
            "max_alert_cache_size" => {
                next.mesh.max_alert_cache_size = value.parse().context("Invalid number")?;
            }
            "reconnect_base_delay_ms" => {
                next.mesh.signaling.reconnect_base_delay_ms =
                    value.parse().context("Invalid number")?;
            }
            "max_reconnect_attempts" => {
                next.mesh.signaling.max_reconnect_attempts =
                    value.parse().context("Invalid number")?;
            }
            "max_pending_messages" => {
                next.mesh.signaling.max_pending_messages =
                    value.parse().context("Invalid number")?;
            }
            "ordered" => {
                next.mesh.transport.ordered = value.parse().context("Invalid boolean value")?;
            }
            "max_retransmits" => {
                next.mesh.transport.max_retransmits = value.parse().context("Invalid number")?;
            }
            "ice_servers" => {
                // Comma-separated STUN/TURN urls; credentials are edited in the file
                next.mesh.transport.ice_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(|url| IceServerConfig {
                        urls: vec![url.to_string()],
                        username: None,
                        credential: None,
                    })
                    .collect();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        next.mesh.validate().context("Rejected configuration")?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        let ice_servers = mesh
            .transport
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter().cloned())
            .collect::<Vec<_>>()
            .join(",");

        vec![
            ("device_id".to_string(), self.device.id.clone()),
            ("device_name".to_string(), self.device.name.clone()),
            ("device_type".to_string(), self.device.device_type.clone()),
            ("signaling_url".to_string(), mesh.signaling.url.clone()),
            ("discovery_interval_ms".to_string(), mesh.discovery_interval_ms.to_string()),
            ("heartbeat_interval_ms".to_string(), mesh.heartbeat_interval_ms.to_string()),
            ("max_peers".to_string(), mesh.max_peers.to_string()),
            ("max_hops".to_string(), mesh.max_hops.to_string()),
            ("max_alert_cache_size".to_string(), mesh.max_alert_cache_size.to_string()),
            (
                "reconnect_base_delay_ms".to_string(),
                mesh.signaling.reconnect_base_delay_ms.to_string(),
            ),
            (
                "max_reconnect_attempts".to_string(),
                mesh.signaling.max_reconnect_attempts.to_string(),
            ),
            (
                "max_pending_messages".to_string(),
                mesh.signaling.max_pending_messages.to_string(),
            ),
            ("ordered".to_string(), mesh.transport.ordered.to_string()),
            ("max_retransmits".to_string(), mesh.transport.max_retransmits.to_string()),
            ("ice_servers".to_string(), ice_servers),
        ]
    }
}

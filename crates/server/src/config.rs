//! Server configuration
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or no file at all) yields a working server.

use std::path::Path;

use beacon_core::hub::HubConfig;
use serde::Deserialize;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the listener on
    pub bind_addr: String,
    /// Port to listen on
    pub port: u16,
    /// Identifier of the always-present room
    pub primary_room_id: String,
    /// Display name of the always-present room
    pub primary_room_name: String,
    /// Maximum joined members per room
    pub max_room_members: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 9465,
            primary_room_id: hub.primary_room_id,
            primary_room_name: hub.primary_room_name,
            max_room_members: hub.max_room_members,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// The listener address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Convert into the hub's room settings
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            primary_room_id: self.primary_room_id.clone(),
            primary_room_name: self.primary_room_name.clone(),
            max_room_members: self.max_room_members,
        }
    }
}

//! Global CLI configuration management
//!
//! Stores the default signaling URL, access token and ICE servers in
//! ~/.peerlink/config.json

use anyhow::{Context, Result};
use peerlink_lib::IceServer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerlinkConfig {
    /// Default signaling URL for `forward` and `ping`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_url: Option<String>,

    /// Default access token for the signaling socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// STUN/TURN servers offered on every dial
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

/// Configuration manager
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for ~/.peerlink/config.json
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::at(home.join(".peerlink").join("config.json")))
    }

    /// Manager for an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<PeerlinkConfig> {
        // Return default config if file doesn't exist
        if !self.path.exists() {
            return Ok(PeerlinkConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        let config: PeerlinkConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &PeerlinkConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;

        Ok(())
    }

    pub fn set_url(&self, url: String) -> Result<()> {
        self.update(|config| config.signaling_url = Some(url))
    }

    pub fn set_token(&self, token: String) -> Result<()> {
        self.update(|config| config.token = Some(token))
    }

    /// Add an ICE server, replacing an entry with the same URLs
    pub fn add_ice_server(&self, server: IceServer) -> Result<()> {
        self.update(|config| {
            config.ice_servers.retain(|s| s.urls != server.urls);
            config.ice_servers.push(server);
        })
    }

    /// Reset to defaults
    pub fn clear(&self) -> Result<()> {
        self.save(&PeerlinkConfig::default())
    }

    fn update(&self, change: impl FnOnce(&mut PeerlinkConfig)) -> Result<()> {
        let mut config = self.load()?;
        change(&mut config);
        self.save(&config)
    }
}

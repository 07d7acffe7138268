//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::calling::machine::EngineConfig;
use crate::calling::rtc::{RtcConfig, DEFAULT_ICE_SERVERS};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local user id announced in offers
    pub user_id: Option<String>,
    /// WebSocket pub/sub relay (ws:// or wss://)
    pub signaling_url: Option<String>,
    /// Base URL of the REST call log; records are skipped when unset
    pub records_url: Option<String>,
    /// Sent as `apikey` and bearer token to the call log
    pub records_api_key: Option<String>,
    pub ice_servers: Vec<String>,
    pub settle_delay_ms: u64,
    /// 0 disables the setup timeout
    pub setup_timeout_secs: u64,
    pub ring_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: None,
            signaling_url: None,
            records_url: None,
            records_api_key: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            settle_delay_ms: 2000,
            setup_timeout_secs: 45,
            ring_interval_ms: 2000,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // The API key is a credential
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Engine settings for `user_id` in `conversation_id`.
    pub fn engine_config(&self, user_id: &str, conversation_id: &str) -> EngineConfig {
        let mut engine = EngineConfig::new(user_id, conversation_id);
        engine.rtc = RtcConfig::from_urls(self.ice_servers.iter().cloned());
        engine.settle_delay = Duration::from_millis(self.settle_delay_ms);
        engine.setup_timeout = match self.setup_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        engine.ring_interval = Duration::from_millis(self.ring_interval_ms.max(100));
        engine
    }
}

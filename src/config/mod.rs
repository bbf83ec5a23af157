//! Configuration and credential storage

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::{StoredToken, TokenStore};

const DEFAULT_API_URL: &str = "http://localhost:5000/api";
const DEFAULT_SOCKET_URL: &str = "http://localhost:5000";

/// Chat timing and paging knobs. Every field has a default, so a partial
/// `[chat]` table is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub connect_timeout_ms: u64,
    pub typing_idle_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    /// How long to wait for `conversation-joined` before sending anyway.
    pub join_settle_ms: u64,
    pub image_ack_timeout_ms: u64,
    pub history_page_size: u32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            typing_idle_ms: 3_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 10_000,
            reconnect_max_attempts: 5,
            join_settle_ms: 1_000,
            image_ack_timeout_ms: 30_000,
            history_page_size: 50,
        }
    }
}

impl ChatSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_millis(self.join_settle_ms)
    }

    pub fn image_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.image_ack_timeout_ms)
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST base URL, including the `/api` prefix
    pub api_url: String,
    /// Socket.IO server base URL
    pub socket_url: String,
    /// Bearer token of the logged-in account
    pub token: Option<StoredToken>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub chat: ChatSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            token: None,
            user_id: None,
            user_name: None,
            chat: ChatSettings::default(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "hallchat", "hallchat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, then apply `HALLCHAT_*` environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("HALLCHAT_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = var("HALLCHAT_SOCKET_URL") {
            self.socket_url = url;
        }
        if let Some(token) = var("HALLCHAT_TOKEN") {
            self.token = Some(StoredToken::new(token, None));
        }
    }
}

impl TokenStore for Config {
    fn get_token(&self) -> Option<StoredToken> {
        self.token.clone()
    }

    fn set_token(&mut self, token: String, expires_in: Option<u64>) {
        self.token = Some(StoredToken::new(token, expires_in));
    }

    fn clear_tokens(&mut self) {
        self.token = None;
        self.user_id = None;
        self.user_name = None;
    }
}

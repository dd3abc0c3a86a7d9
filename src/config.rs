//! Configuration loading and persistence.
//!
//! Handles reading and writing the notification-sync configuration file.
//! Credentials are never stored here; the session lives in the HTTP client's
//! cookie jar for the lifetime of the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::constants;

/// Configuration for the sync engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the notification backend.
    pub server_url: String,
    /// Page size fetched by a full refresh.
    pub page_limit: u32,
    /// Per-request timeout in seconds for request/response calls.
    pub request_timeout_secs: u64,
    /// First reconnection delay for the event stream, in milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnection delay ceiling for the event stream, in milliseconds.
    pub reconnect_max_ms: u64,
    /// End the session when credential renewal is exhausted.
    pub end_session_on_renewal_exhausted: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            page_limit: constants::DEFAULT_PAGE_LIMIT,
            request_timeout_secs: constants::HTTP_REQUEST_TIMEOUT.as_secs(),
            reconnect_base_ms: duration_millis(constants::RECONNECT_BASE_DELAY),
            reconnect_max_ms: duration_millis(constants::RECONNECT_MAX_DELAY),
            end_session_on_renewal_exhausted: true,
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `NOTIFY_SYNC_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("NOTIFY_SYNC_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("notification-sync")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config ({e:#})");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific file without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("NOTIFY_SYNC_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(limit) = std::env::var("NOTIFY_SYNC_PAGE_LIMIT") {
            if let Ok(limit) = limit.parse::<u32>() {
                self.page_limit = limit;
            }
        }

        if let Ok(timeout) = std::env::var("NOTIFY_SYNC_REQUEST_TIMEOUT") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.request_timeout_secs = timeout;
            }
        }

        if let Ok(base) = std::env::var("NOTIFY_SYNC_RECONNECT_BASE_MS") {
            if let Ok(base) = base.parse::<u64>() {
                self.reconnect_base_ms = base;
            }
        }

        if let Ok(max) = std::env::var("NOTIFY_SYNC_RECONNECT_MAX_MS") {
            if let Ok(max) = max.parse::<u64>() {
                self.reconnect_max_ms = max;
            }
        }
    }

    /// Persists the current configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?.join("config.json"))
    }

    /// Persists the configuration to `path` with owner-only permissions.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Request timeout as a [`Duration`]. Zero falls back to the default.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_secs == 0 {
            constants::HTTP_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    /// Server URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

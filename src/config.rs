//! Configuration for the agent store and the mirror server.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

const DEFAULT_MIRROR_PORT: u16 = 9470;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the redb database file. Defaults to a file under the
    /// platform data directory.
    pub store_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether the background sync worker runs at all.
    pub enabled: bool,
    /// Base URL of the shared mirror. Required when sync is enabled.
    pub remote_url: Option<Url>,
    /// Time between sync cycles, e.g. `30s` or `2m`.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Address the mirror server binds to.
    pub bind_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            sync: SyncConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_url: None,
            interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// The mirror URL to sync against, or `None` when sync is disabled.
    /// Fails when sync is enabled without a remote.
    pub fn remote(&self) -> Result<Option<&Url>> {
        if !self.enabled {
            return Ok(None);
        }
        self.remote_url
            .as_ref()
            .map(Some)
            .context("sync is enabled but no remote_url is configured")
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_MIRROR_PORT),
        }
    }
}

impl Config {
    /// Parse a toml config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.to_string_lossy()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.to_string_lossy()))?;
        Ok(config)
    }

    /// Load the given file, or fall back to defaults when no path is given
    /// and no file exists at the default location.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Self::default_config_path()?;
                if default.exists() {
                    Self::load(&default)
                } else {
                    debug!("no config file, using defaults");
                    Ok(Config::default())
                }
            }
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("config.toml"))
    }

    /// Platform data directory for this application.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs_next::data_dir()
            .context("operating system data directory is not available")?;
        Ok(dir.join("worldgraph"))
    }

    /// Resolved path of the database file.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("world.redb")),
        }
    }
}

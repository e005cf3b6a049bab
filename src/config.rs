use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{AssetPolicy, LocalStore};

const DEFAULT_API_URL: &str = "http://localhost:1337";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Backend origin, e.g. http://localhost:1337
  pub api_url: Url,
  /// Local store location (defaults to the platform data directory)
  pub database_path: Option<PathBuf>,
  /// How often `watch` probes the backend for reachability
  pub probe_interval_secs: u64,
  /// Periodic background sync; off when unset
  pub periodic_sync_secs: Option<u64>,
  pub request_timeout_secs: Option<u64>,
  pub assets: AssetsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
  /// Bump to drop everything cached under older versions
  pub cache_version: String,
  /// Foreign assets fetched up front by `precache`
  pub precache: Vec<Url>,
  /// Hosts whose assets are cached on first fetch
  pub font_hosts: Vec<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      database_path: None,
      probe_interval_secs: 15,
      periodic_sync_secs: None,
      request_timeout_secs: Some(10),
      assets: AssetsConfig::default(),
    }
  }
}

impl Default for AssetsConfig {
  fn default() -> Self {
    Self {
      cache_version: "v1".to_string(),
      precache: Vec::new(),
      font_hosts: vec![
        "fonts.gstatic.com".to_string(),
        "use.fontawesome.com".to_string(),
      ],
    }
  }
}

impl AssetsConfig {
  pub fn policy(&self) -> AssetPolicy {
    AssetPolicy {
      cache_version: self.cache_version.clone(),
      precache: self.precache.clone(),
      font_hosts: self.font_hosts.clone(),
    }
  }
}

fn default_api_url() -> Url {
  // Constant, known-good URL
  Url::parse(DEFAULT_API_URL).unwrap_or_else(|_| unreachable!())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rrsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rrsync/config.yaml
  ///
  /// With no file at all the defaults apply. `RRSYNC_API_URL` overrides
  /// `api_url` either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rrsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rrsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means all defaults
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn with_env_overrides(self) -> Result<Self> {
    match std::env::var("RRSYNC_API_URL") {
      Ok(url) => self.with_api_url(&url),
      Err(_) => Ok(self),
    }
  }

  pub fn with_api_url(self, url: &str) -> Result<Self> {
    let api_url = Url::parse(url).map_err(|e| eyre!("Invalid API URL '{url}': {e}"))?;
    Ok(Self { api_url, ..self })
  }

  /// Where the local store lives.
  pub fn store_path(&self) -> Option<PathBuf> {
    self.database_path.clone().or_else(LocalStore::default_path)
  }

  /// Directory for the `watch` log file, next to the store.
  pub fn log_dir(&self) -> Option<PathBuf> {
    self
      .store_path()
      .and_then(|path| path.parent().map(Path::to_path_buf))
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.request_timeout_secs.map(Duration::from_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn periodic_sync(&self) -> Option<Duration> {
    self
      .periodic_sync_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::ReplayPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub project_id: String,
  /// Collection holding the vehicle documents
  #[serde(default = "default_collection")]
  pub collection: String,
  #[serde(default = "default_base_url")]
  pub base_url: String,
  /// How often the live view re-runs its query
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      project_id: String::new(),
      collection: default_collection(),
      base_url: default_base_url(),
      poll_interval_secs: default_poll_interval(),
      request_timeout_secs: default_request_timeout(),
    }
  }
}

fn default_collection() -> String {
  "vehicles".to_string()
}

fn default_base_url() -> String {
  "https://firestore.googleapis.com/v1/".to_string()
}

fn default_poll_interval() -> u64 {
  5
}

fn default_request_timeout() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// host:port used to decide whether the remote store is reachable
  pub probe_address: String,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_address: "firestore.googleapis.com:443".to_string(),
      probe_interval_secs: 10,
      probe_timeout_ms: 2000,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// What happens to mutations whose replay fails during a sync pass
  pub replay_policy: ReplayPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file; defaults to the platform data directory
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./parkwatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/parkwatch/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/parkwatch/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("parkwatch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("parkwatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.remote.project_id.trim().is_empty() {
      return Err(eyre!("remote.project_id must not be empty"));
    }
    Ok(config)
  }

  /// Get the remote store API key from the environment, if any.
  ///
  /// Checks PARKWATCH_API_KEY.
  pub fn get_api_key() -> Option<String> {
    std::env::var("PARKWATCH_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }
}

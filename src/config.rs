use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::queue::QueueConfig;
use crate::rules::RuleConfig;

/// Static engine configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the front end is served from; app-shell paths resolve
  /// against it
  pub origin: String,
  /// Deployment version tag embedded in cache names
  pub version: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub shell: ShellConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
  #[serde(default)]
  pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to run every request straight through to the network
  pub enabled: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
  /// Routes precached at activation for instant navigation
  pub routes: Vec<String>,
  /// Base name of the cache holding the shell
  pub cache: String,
  /// Document served when a navigation has no cache and no network
  pub offline_document: Option<String>,
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      routes: Vec::new(),
      cache: "app-shell".to_string(),
      offline_document: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic queue replay interval; 0 disables the timer
  pub periodic_seconds: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      periodic_seconds: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Title used when a push payload doesn't carry one
  pub default_title: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Touchline".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./touchline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/touchline/config.yaml
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
        "No configuration file found. Create one at ~/.config/touchline/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("touchline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("touchline").join("config.yaml");
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
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid YAML: {}", e))?;

    if config.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    config.origin_url()?;

    Ok(config)
  }

  /// The configured origin as a parsed URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve an app-shell route against the origin.
  pub fn shell_url(&self, route: &str) -> Result<Url> {
    let origin = self.origin_url()?;
    origin
      .join(route)
      .map_err(|e| eyre!("Invalid shell route {}: {}", route, e))
  }

  /// The default data directory for the cache and queue databases.
  pub fn default_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("touchline"))
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::KeyScope;
use crate::storage::SqliteDatabase;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Document URL the values endpoints hang off
  pub base_url: String,
  /// How the remote interprets written cells (e.g. "USER_ENTERED", "RAW")
  #[serde(default = "default_value_input_option")]
  pub value_input_option: String,
  /// Seconds between connectivity probes (0 disables the background probe)
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

fn default_value_input_option() -> String {
  "USER_ENTERED".to_string()
}

fn default_probe_interval() -> u64 {
  30
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyScopeKind {
  /// One cache entry per resource id
  #[default]
  Exact,
  /// One cache entry per collection (text before the separator)
  Collection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to always go to the network (reads still fail over to nothing)
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub key_scope: KeyScopeKind,
  #[serde(default = "default_separator")]
  pub collection_separator: char,
  /// SQLite file for cache and queue (default: $XDG_DATA_HOME/sheetsync/sync.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      key_scope: KeyScopeKind::default(),
      collection_separator: default_separator(),
      database: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_separator() -> char {
  '!'
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// 0 leaves attempts unbounded
  pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 300,
      max_delay_ms: 10_000,
      attempt_timeout_ms: 15_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
  pub window_secs: u64,
  pub grace_ms: u64,
}

impl Default for DedupConfig {
  fn default() -> Self {
    Self {
      window_secs: 30,
      grace_ms: 100,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sheetsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sheetsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/sheetsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("sheetsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sheetsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.retry.max_retries,
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
      max_delay: Duration::from_millis(self.retry.max_delay_ms),
      attempt_timeout: match self.retry.attempt_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
      },
      ..RetryPolicy::default()
    }
  }

  pub fn key_scope(&self) -> KeyScope {
    match self.cache.key_scope {
      KeyScopeKind::Exact => KeyScope::Exact,
      KeyScopeKind::Collection => KeyScope::Collection {
        separator: self.cache.collection_separator,
      },
    }
  }

  pub fn dedup_window(&self) -> Duration {
    Duration::from_secs(self.dedup.window_secs)
  }

  pub fn dedup_grace(&self) -> Duration {
    Duration::from_millis(self.dedup.grace_ms)
  }

  pub fn probe_interval(&self) -> Option<Duration> {
    match self.remote.probe_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => SqliteDatabase::default_path(),
    }
  }
}

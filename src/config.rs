use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use habit_sync::sync::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://abc.supabase.co
  pub url: String,
  /// Owner of the habit logs written from this device
  pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Retryable failures tolerated before a write is reverted
  pub retry_ceiling: u32,
  pub request_timeout_secs: u64,
  /// How often `watch` probes the backend
  pub probe_interval_secs: u64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      retry_ceiling: 3,
      request_timeout_secs: 15,
      probe_interval_secs: 5,
    }
  }
}

impl SyncSettings {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn engine_config(&self) -> SyncConfig {
    SyncConfig {
      retry_ceiling: self.retry_ceiling,
      request_timeout: self.request_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Snapshot entries older than this are not restored
  pub max_age_hours: i64,
  /// Most entries written to the snapshot
  pub max_entries: usize,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      max_age_hours: 24,
      max_entries: 50,
    }
  }
}

impl CacheSettings {
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::hours(self.max_age_hours)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./habit-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/habit-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/habit-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("habit-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("habit-sync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    if config.backend.url.trim().is_empty() {
      return Err(eyre!("backend.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks HABIT_SYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("HABIT_SYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set HABIT_SYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}

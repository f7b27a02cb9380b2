use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::{PipelineOptions, TtlPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the marketplace API, e.g. https://api.example.com/api/
  pub base_url: String,
  /// Per-request network timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
  pub sweep_interval_secs: u64,
  /// How long a settled read stays joinable by identical requests
  pub coalesce_grace_ms: u64,
  /// Per-endpoint lifetimes, matched by path prefix
  pub rules: Vec<TtlRule>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 300,
      sweep_interval_secs: 600,
      coalesce_grace_ms: 250,
      rules: vec![TtlRule {
        prefix: "notifications/unread-count".to_string(),
        ttl_secs: 30,
      }],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtlRule {
  pub prefix: String,
  pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  pub cooldown_ms: u64,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self { cooldown_ms: 1000 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub page_size: usize,
  pub message_interval_secs: u64,
  pub notification_interval_secs: u64,
  /// Rows from the bottom within which the message list counts as "at the bottom"
  pub near_bottom_rows: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      page_size: 20,
      message_interval_secs: 20,
      notification_interval_secs: 120,
      near_bottom_rows: 3,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./drivelink.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/drivelink/config.yaml
  ///
  /// `DRIVELINK_API_URL` overrides `api.base_url`.
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

    let mut config = match (path, std::env::var("DRIVELINK_API_URL").ok()) {
      (Some(p), _) => Self::load_from_path(&p)?,
      (None, Some(url)) => Config {
        api: ApiConfig {
          base_url: url,
          timeout_secs: default_timeout_secs(),
        },
        cache: CacheConfig::default(),
        session: SessionConfig::default(),
        sync: SyncConfig::default(),
      },
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/drivelink/config.yaml\n\
                 or set DRIVELINK_API_URL."
        ))
      }
    };

    if let Ok(url) = std::env::var("DRIVELINK_API_URL") {
      config.api.base_url = url;
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("drivelink.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("drivelink").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn pipeline_options(&self) -> PipelineOptions {
    PipelineOptions {
      ttl_policy: TtlPolicy::from_config(&self.cache),
      coalesce_grace: Duration::from_millis(self.cache.coalesce_grace_ms),
      session_cooldown: Duration::from_millis(self.session.cooldown_ms),
    }
  }

  /// Get the login password from the environment, if set.
  pub fn get_password() -> Option<String> {
    std::env::var("DRIVELINK_PASSWORD").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  base_url: https://api.example.com/\n").unwrap();
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.sync.page_size, 20);
    assert_eq!(config.sync.message_interval_secs, 20);
    assert_eq!(config.sync.notification_interval_secs, 120);
    assert_eq!(
      config
        .pipeline_options()
        .ttl_policy
        .ttl_for("notifications/unread-count"),
      Duration::from_secs(30)
    );
  }

  #[test]
  fn test_partial_sections_fill_defaults() {
    let yaml = r#"
api:
  base_url: https://api.example.com/
  timeout_secs: 10
cache:
  default_ttl_secs: 60
  rules:
    - prefix: vehicles
      ttl_secs: 600
sync:
  message_interval_secs: 5
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.timeout(), Duration::from_secs(10));
    assert_eq!(config.cache.sweep_interval_secs, 600);
    assert_eq!(config.cache.rules.len(), 1);
    assert_eq!(config.sync.message_interval_secs, 5);
    assert_eq!(config.sync.page_size, 20);
    assert_eq!(config.session.cooldown_ms, 1000);
  }

  #[test]
  fn test_missing_base_url_is_an_error() {
    assert!(Config::from_yaml("cache:\n  default_ttl_secs: 1\n").is_err());
  }
}

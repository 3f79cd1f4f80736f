use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheOptions, DEFAULT_GC_GRACE};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Site root of the CRM backend, e.g. https://crm.example.com
  pub url: String,
  /// Per-request timeout; unset means wait indefinitely
  pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long an unobserved entry is kept
  #[serde(default = "default_gc_grace_secs")]
  pub gc_grace_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      gc_grace_secs: default_gc_grace_secs(),
    }
  }
}

fn default_gc_grace_secs() -> u64 {
  DEFAULT_GC_GRACE.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Read the config, letting `url_override` replace `api.url`.
  ///
  /// Files are tried in order: `explicit_path`, `./crmq.yaml`, then
  /// `crmq/config.yaml` in the user config dir. With no file at all an
  /// override URL is enough on its own. A file that exists but fails to
  /// parse is always an error.
  pub fn load(explicit_path: Option<&Path>, url_override: Option<&str>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.is_file() => return Err(eyre!("{} does not exist", p.display())),
      Some(p) => Some(p.to_path_buf()),
      None => Self::discover(),
    };
    Self::resolve(path.as_deref(), url_override)
  }

  /// Configuration with only the API URL set.
  pub fn for_url(url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        url: url.into(),
        request_timeout_secs: None,
      },
      cache: CacheConfig::default(),
      log: LogConfig::default(),
    }
  }

  fn resolve(path: Option<&Path>, url_override: Option<&str>) -> Result<Self> {
    let mut config = match (path, url_override) {
      (Some(path), _) => Self::read(path)?,
      (None, Some(url)) => Self::for_url(url),
      (None, None) => {
        return Err(eyre!(
          "no crmq.yaml in the working directory or the user config dir; \
           pass --config <file> or --url <site>"
        ))
      }
    };
    if let Some(url) = url_override {
      config.api.url = url.to_string();
    }
    Ok(config)
  }

  fn discover() -> Option<PathBuf> {
    let user = dirs::config_dir().map(|dir| dir.join("crmq").join("config.yaml"));
    std::iter::once(PathBuf::from("crmq.yaml"))
      .chain(user)
      .find(|p| p.is_file())
  }

  fn read(path: &Path) -> Result<Self> {
    let contents =
      std::fs::read_to_string(path).map_err(|e| eyre!("cannot read {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("invalid config in {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.api.request_timeout_secs.map(Duration::from_secs)
  }

  pub fn cache_options(&self) -> CacheOptions {
    CacheOptions {
      gc_grace: Duration::from_secs(self.cache.gc_grace_secs),
    }
  }

  /// Get the API token from the environment, if any.
  ///
  /// Checks CRMQ_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CRMQ_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

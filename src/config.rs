use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::CacheConfig;
use crate::network::{ConnectivityProbe, HttpProbe, NetworkMonitor};
use crate::telemetry::TelemetryConfig;

const DEFAULT_PROBE_URL: &str = "https://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub cache: CacheSection,
  pub network: NetworkSection,
  pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (defaults to `<data_dir>/offline-sync/store.db`)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub namespace: String,
  pub ttl_secs: u64,
  /// Cache keys invalidated after queued writes are replayed
  pub refresh_keys: Vec<String>,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      namespace: "cache".to_string(),
      ttl_secs: 24 * 60 * 60,
      refresh_keys: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
  /// Endpoint probed for reachability (defaults to a 204 check endpoint)
  pub probe_url: Option<Url>,
  pub probe_timeout_ms: u64,
  pub poll_interval_secs: u64,
}

impl Default for NetworkSection {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_timeout_ms: 5_000,
      poll_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
  /// Collector endpoint; telemetry stays local when unset
  pub endpoint: Option<Url>,
  pub batch_size: usize,
  pub flush_interval_secs: u64,
}

impl Default for TelemetrySection {
  fn default() -> Self {
    Self {
      endpoint: None,
      batch_size: 20,
      flush_interval_secs: 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// Defaults are used when no file is found.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sync").join("config.yaml");
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
    // An empty file is a valid "all defaults" config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.cache_ttl().is_none() {
      return Err(eyre!("cache.ttl_secs {} is out of range", config.cache.ttl_secs));
    }
    Ok(config)
  }

  fn cache_ttl(&self) -> Option<chrono::Duration> {
    i64::try_from(self.cache.ttl_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
  }

  /// Bearer token for the telemetry collector, from OFFLINE_SYNC_TELEMETRY_TOKEN.
  pub fn telemetry_token() -> Option<String> {
    std::env::var("OFFLINE_SYNC_TELEMETRY_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      namespace: self.cache.namespace.clone(),
      // Only reachable out of range when built by hand rather than parsed
      ttl: self.cache_ttl().unwrap_or(chrono::Duration::MAX),
    }
  }

  pub fn telemetry_config(&self) -> TelemetryConfig {
    TelemetryConfig {
      batch_size: self.telemetry.batch_size.max(1),
      flush_interval: Duration::from_secs(self.telemetry.flush_interval_secs.max(1)),
    }
  }

  pub fn probe_url(&self) -> Result<Url> {
    match &self.network.probe_url {
      Some(url) => Ok(url.clone()),
      None => {
        Url::parse(DEFAULT_PROBE_URL).map_err(|e| eyre!("Invalid default probe URL: {}", e))
      }
    }
  }

  pub fn http_probe(&self) -> Result<HttpProbe> {
    HttpProbe::new(self.probe_url()?, self.probe_timeout())
  }

  /// Monitor over `probe` using the configured timeout, polling on the
  /// configured interval.
  pub fn network_monitor(&self, probe: Arc<dyn ConnectivityProbe>) -> NetworkMonitor {
    let monitor = NetworkMonitor::new(probe, self.probe_timeout());
    monitor.poll_every(self.poll_interval());
    monitor
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.network.probe_timeout_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.network.poll_interval_secs.max(1))
  }
}

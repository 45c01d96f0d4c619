// Server configuration file.
//
// Default location: `~/.coscribe/coscribe.toml`, overridable with `--config`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root directory for Coscribe state: `~/.coscribe/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".coscribe"))
}

/// Path to the config file: `~/.coscribe/coscribe.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|dir| dir.join("coscribe.toml"))
}

/// Server configuration at `~/.coscribe/coscribe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the WebSocket endpoint.
    pub bind_addr: String,
    /// Where snapshots live. Defaults to `~/.coscribe/data`.
    pub data_dir: Option<PathBuf>,
    /// Durable-write coalescing.
    pub save: SaveConfig,
    /// Presence eviction.
    pub presence: PresenceConfig,
    /// AI generation backend.
    pub generation: GenerationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7171".to_string(),
            data_dir: None,
            save: SaveConfig::default(),
            presence: PresenceConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SaveConfig {
    /// Quiet interval before a durable write, in milliseconds.
    pub debounce_ms: u64,
    /// Backoff before the single persistence retry, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self { debounce_ms: 300, retry_backoff_ms: 250 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    /// Inactivity timeout after which a presence entry is evicted.
    pub ttl_secs: u64,
    /// How often the inactivity sweep runs.
    pub sweep_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_secs: 30, sweep_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Streaming generation endpoint URL. Queries fail cleanly when unset.
    pub endpoint: Option<String>,
    /// Model identifier forwarded to the backend.
    pub model: Option<String>,
    /// Per-event timeout for the generation stream, in seconds.
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { endpoint: None, model: None, timeout_secs: 60 }
    }
}

/// Time-driven tunables handed to each document session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub debounce_quiet: Duration,
    pub save_retry_backoff: Duration,
    pub presence_ttl: Duration,
    pub presence_sweep: Duration,
    pub generation_timeout: Duration,
}

impl ServerConfig {
    /// Load from `~/.coscribe/coscribe.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|path| Self::load_from(&path).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config `{}`", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config `{}`", path.display()))
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config `{}`", path.display()))
    }

    /// Resolve the data directory, defaulting under the global dir.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        global_dir()
            .map(|dir| dir.join("data"))
            .context("could not determine home directory; set data_dir in the config")
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            debounce_quiet: Duration::from_millis(self.save.debounce_ms),
            save_retry_backoff: Duration::from_millis(self.save.retry_backoff_ms),
            presence_ttl: Duration::from_secs(self.presence.ttl_secs),
            presence_sweep: Duration::from_secs(self.presence.sweep_secs),
            generation_timeout: Duration::from_secs(self.generation.timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:7171");
        assert_eq!(config.save.debounce_ms, 300);
        assert_eq!(config.presence.ttl_secs, 30);
        assert_eq!(config.generation.timeout_secs, 60);
        assert!(config.generation.endpoint.is_none());
    }

    #[test]
    fn round_trips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coscribe.toml");

        let mut config = ServerConfig::default();
        config.bind_addr = "0.0.0.0:9000".to_string();
        config.save.debounce_ms = 150;
        config.generation.endpoint = Some("http://localhost:8311/generate".to_string());

        config.save_to(&path).expect("save should succeed");
        let loaded = ServerConfig::load_from(&path).expect("load should succeed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coscribe.toml");
        std::fs::write(&path, "bind_addr = \"[::1]:4000\"\n").unwrap();

        let loaded = ServerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.bind_addr, "[::1]:4000");
        assert_eq!(loaded.save.debounce_ms, 300);
    }

    #[test]
    fn missing_file_is_an_error_for_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load_from(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn timings_convert_units() {
        let config = ServerConfig::default();
        let timings = config.timings();
        assert_eq!(timings.debounce_quiet, Duration::from_millis(300));
        assert_eq!(timings.presence_ttl, Duration::from_secs(30));
        assert_eq!(timings.generation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let mut config = ServerConfig::default();
        config.data_dir = Some(PathBuf::from("/tmp/coscribe-data"));
        assert_eq!(config.resolved_data_dir().unwrap(), PathBuf::from("/tmp/coscribe-data"));
    }
}

// Tunables for the realtime layer.
//
// Global config: `~/.pagesync/realtime.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pagesync_common::crdt::envelope::DEFAULT_DELTA_EVENT;

/// Root directory for pagesync global state: `~/.pagesync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".pagesync"))
}

/// Path to the global realtime config file: `~/.pagesync/realtime.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("realtime.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RealtimeConfig {
    pub reconnect: ReconnectConfig,
    pub optimistic: OptimisticConfig,
    pub crdt: CrdtConfig,
}

impl RealtimeConfig {
    /// Load from `~/.pagesync/realtime.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

// ── Reconnect ──────────────────────────────────────────────────────

/// Capped exponential backoff for automatic channel reconnection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Automatic attempts before the channel gives up and reports `Error`.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: 8 }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16); // cap exponent to avoid overflow
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << exp).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

// ── Optimistic overlay ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OptimisticConfig {
    pub create_ttl_ms: u64,
    pub update_ttl_ms: u64,
    pub delete_ttl_ms: u64,
    /// Max distance between local and confirmed `created_at` for a heuristic match.
    pub reconcile_window_ms: u64,
    /// Match confirmed inserts by title/parent/workspace/time, not only by id.
    pub heuristic_matching: bool,
    /// Extra attempts for remote calls that fail with a transient error.
    pub remote_retries: u32,
    pub remote_retry_delay_ms: u64,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            create_ttl_ms: 10_000,
            update_ttl_ms: 30_000,
            delete_ttl_ms: 30_000,
            reconcile_window_ms: 5_000,
            heuristic_matching: true,
            remote_retries: 2,
            remote_retry_delay_ms: 200,
        }
    }
}

impl OptimisticConfig {
    pub fn create_ttl(&self) -> Duration {
        Duration::from_millis(self.create_ttl_ms)
    }

    pub fn update_ttl(&self) -> Duration {
        Duration::from_millis(self.update_ttl_ms)
    }

    pub fn delete_ttl(&self) -> Duration {
        Duration::from_millis(self.delete_ttl_ms)
    }
}

// ── CRDT relay ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CrdtConfig {
    /// Grace period between "subscribed" and broadcasting local edits.
    pub live_delay_ms: u64,
    pub broadcast_event: String,
    /// Name of the shared text inside each replica document.
    pub text_name: String,
    /// Out-of-order deltas kept waiting for their dependencies. Past this the
    /// backlog is dropped and the replica relies on persisted content.
    pub max_held_deltas: usize,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            live_delay_ms: 100,
            broadcast_event: DEFAULT_DELTA_EVENT.to_string(),
            text_name: "content".to_string(),
            max_held_deltas: 256,
        }
    }
}

impl CrdtConfig {
    pub fn live_delay(&self) -> Duration {
        Duration::from_millis(self.live_delay_ms)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read or write realtime config: {0}")]
    Io(#[source] std::io::Error),
    #[error("realtime config is not valid TOML: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("cannot encode realtime config: {0}")]
    Serialize(#[source] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = RealtimeConfig::default();
        assert_eq!(config.optimistic.create_ttl(), Duration::from_secs(10));
        assert_eq!(config.optimistic.update_ttl(), Duration::from_secs(30));
        assert_eq!(config.optimistic.delete_ttl(), Duration::from_secs(30));
        assert_eq!(config.optimistic.reconcile_window_ms, 5_000);
        assert_eq!(config.crdt.broadcast_event, "crdt-delta");
        assert_eq!(config.crdt.max_held_deltas, 256);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig { base_delay_ms: 100, max_delay_ms: 1_000, max_attempts: 5 };
        assert_eq!(reconnect.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(reconnect.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(reconnect.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(reconnect.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(reconnect.backoff_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: RealtimeConfig = toml::from_str(
            r#"
            [reconnect]
            max_attempts = 3

            [crdt]
            live_delay_ms = 0
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 250);
        assert_eq!(config.crdt.live_delay_ms, 0);
        assert_eq!(config.optimistic, OptimisticConfig::default());
    }

    #[test]
    fn unknown_section_fields_are_rejected() {
        let result: Result<RealtimeConfig, _> = toml::from_str("[optimistic]\nttl = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().expect("tempdir should be created");
        let path = dir.path().join("nested").join("realtime.toml");

        let mut config = RealtimeConfig::default();
        config.optimistic.heuristic_matching = false;
        config.reconnect.max_attempts = 2;
        config.save_to(&path).expect("config should save");

        let loaded = RealtimeConfig::load_from(&path).expect("config should load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = TempDir::new().expect("tempdir should be created");
        let err = RealtimeConfig::load_from(&dir.path().join("absent.toml"))
            .expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

//! Watcher configuration
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! debounce_ms = 250
//! buffer_size = 1048576
//! start_timeout_ms = 5000
//! ```

use crate::state::EmissionToggle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default size of each half of the async double buffer (1 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Largest buffer accepted when the watched path is a network share (64 KiB)
pub const NETWORK_BUFFER_SIZE: usize = 64 * 1024;

/// Errors while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Configuration shared by the backends and the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval between batch deliveries in milliseconds (default: 500ms)
    pub debounce_ms: u64,
    /// Size of each async notification buffer in bytes (default: 1 MiB)
    pub buffer_size: usize,
    /// Reduced buffer size used after a network share rejects the default
    pub network_buffer_size: usize,
    /// How long `start()` waits for the worker handshake (default: 10s)
    pub start_timeout_ms: u64,
    /// inotify read buffer in bytes (default: 64 KiB)
    pub read_buffer_size: usize,
    /// Upper bound on reads drained in one inotify wakeup (default: 16)
    pub max_reads_per_cycle: usize,
    /// Whether file-level events are emitted when the watcher starts
    pub emit_file_events: bool,
    /// Live switch seeded from `emit_file_events`
    #[serde(skip)]
    emission: Option<EmissionToggle>,
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> String {
        // Only plain integers and booleans, so serialization cannot fail.
        toml::to_string(self).unwrap_or_default()
    }

    /// Reject values no backend can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 16 {
            return Err(ConfigError::Invalid {
                key: "buffer_size",
                reason: format!("{} bytes cannot hold a single record", self.buffer_size),
            });
        }
        if u32::try_from(self.buffer_size).is_err() {
            return Err(ConfigError::Invalid {
                key: "buffer_size",
                reason: format!("must be at most {} bytes", u32::MAX),
            });
        }
        if self.network_buffer_size < 16 || self.network_buffer_size > self.buffer_size {
            return Err(ConfigError::Invalid {
                key: "network_buffer_size",
                reason: format!(
                    "must be between 16 and buffer_size ({}), got {}",
                    self.buffer_size, self.network_buffer_size
                ),
            });
        }
        if self.read_buffer_size < 4096 {
            return Err(ConfigError::Invalid {
                key: "read_buffer_size",
                reason: "must be at least 4096 bytes".to_string(),
            });
        }
        if self.max_reads_per_cycle == 0 {
            return Err(ConfigError::Invalid {
                key: "max_reads_per_cycle",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Switch the backends poll before emitting file-level events
    ///
    /// The first call creates it from `emit_file_events`; later calls and
    /// clones of this config share the same switch.
    pub fn emission(&mut self) -> EmissionToggle {
        self.emission
            .get_or_insert_with(|| EmissionToggle::new(self.emit_file_events))
            .clone()
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            buffer_size: DEFAULT_BUFFER_SIZE,
            network_buffer_size: NETWORK_BUFFER_SIZE,
            start_timeout_ms: 10_000,
            read_buffer_size: 64 * 1024,
            max_reads_per_cycle: 16,
            emit_file_events: true,
            emission: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.buffer_size, 1024 * 1024);
        assert_eq!(config.network_buffer_size, 64 * 1024);
        assert_eq!(config.start_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WatcherConfig::from_toml_str("debounce_ms = 250\n").unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.emit_file_events);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = WatcherConfig::from_toml_str("network_buffer_size = 4194304\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "network_buffer_size", .. }));

        let err = WatcherConfig::from_toml_str("buffer_size = 5000000000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "buffer_size", .. }));

        let err = WatcherConfig::from_toml_str("max_reads_per_cycle = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "max_reads_per_cycle", .. }));

        let err = WatcherConfig::from_toml_str("debounce_ms = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "start_timeout_ms = 2000").unwrap();
        writeln!(file, "emit_file_events = false").unwrap();

        let mut config = WatcherConfig::load(file.path()).unwrap();
        assert_eq!(config.start_timeout(), Duration::from_secs(2));
        assert!(!config.emission().is_enabled());
    }

    #[test]
    fn test_load_missing_file() {
        let err = WatcherConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_emission_is_shared_across_clones() {
        let mut config = WatcherConfig::default();
        let toggle = config.emission();
        let mut copy = config.clone();

        toggle.disable();
        assert!(!copy.emission().is_enabled());
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let text = WatcherConfig::default().to_toml_string();
        assert!(text.contains("debounce_ms = 500"));
        let parsed = WatcherConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.buffer_size, DEFAULT_BUFFER_SIZE);
    }
}

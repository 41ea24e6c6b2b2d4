//! Configuration for lamad-progression

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ProgressionError;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lamad-progression")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minimum aggregate ratio (0..=1) for a quiz attempt to complete its stage
    #[serde(default = "default_pass_ratio")]
    pub pass_ratio: f64,

    /// Seconds per usage lump flushed to the ledger
    #[serde(default = "default_lump_size")]
    pub lump_size_secs: u64,

    /// Usage tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Flush the sub-lump remainder when a usage timer stops.
    /// When false the tail (at most lump_size_secs - 1) is dropped.
    #[serde(default)]
    pub flush_remainder_on_stop: bool,

    /// Broadcast channel capacity for progression events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_pass_ratio() -> f64 {
    0.6
}

fn default_lump_size() -> u64 {
    15
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pass_ratio: default_pass_ratio(),
            lump_size_secs: default_lump_size(),
            tick_interval_ms: default_tick_interval(),
            flush_remainder_on_stop: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProgressionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ProgressionError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ProgressionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgressionError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ProgressionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ProgressionError> {
        if !(0.0..=1.0).contains(&self.pass_ratio) {
            return Err(ProgressionError::Config(format!(
                "pass_ratio must be within 0..=1, got {}",
                self.pass_ratio
            )));
        }
        if self.lump_size_secs == 0 {
            return Err(ProgressionError::Config("lump_size_secs must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ProgressionError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(ProgressionError::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Usage tick interval
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }
}

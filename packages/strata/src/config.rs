//! Engine configuration.
//!
//! Every field has a default, so a configuration file only needs to name the
//! values it changes:
//!
//! ```toml
//! initial_entity_capacity = 65536
//! max_history_frames = 120
//! worker_threads = 4
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sizing and threading parameters for a `Registry`, `Scheduler` and
/// `SnapshotManager`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The initial size of the entity generation table.
    pub initial_entity_capacity: usize,
    /// The initial capacity of each component storage.
    pub initial_component_capacity: usize,
    /// The initial capacity of the recycled index stack.
    pub free_list_capacity: usize,
    /// The number of frames kept by the snapshot history.
    pub max_history_frames: usize,
    /// The size of the scheduler's worker pool. `None` uses the global pool.
    pub worker_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_entity_capacity: 1024,
            initial_component_capacity: 1024,
            free_list_capacity: 256,
            max_history_frames: 300,
            worker_threads: None,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(source: &str) -> Result<Config> {
        Ok(toml::from_str(source)?)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let source = std::fs::read_to_string(path)?;
        Config::from_toml_str(&source)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_history_frames, 300);
        assert_eq!(config.initial_entity_capacity, 1024);
    }

    #[test]
    fn test_partial() {
        let config = Config::from_toml_str("max_history_frames = 8\nworker_threads = 2\n").unwrap();
        assert_eq!(config.max_history_frames, 8);
        assert_eq!(config.worker_threads, Some(2));
        assert_eq!(config.free_list_capacity, 256);
    }

    #[test]
    fn test_invalid() {
        let err = Config::from_toml_str("max_history_frames = \"lots\"").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}

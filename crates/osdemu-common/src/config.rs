//! Configuration types for OSDEMU
//!
//! This module defines the target configuration loaded by the binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Target configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Device root holding the catalog and the object data files
    pub root: PathBuf,
    /// OSD name written to the root information page on format
    pub osd_name: Option<String>,
    /// Largest output buffer a single command may request
    pub max_output_len: usize,
    /// Bytes described by each READ_MAP descriptor
    pub read_map_chunk: u32,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./osd-root"),
            osd_name: None,
            max_output_len: 64 * 1024 * 1024,
            read_map_chunk: 4,
            logging: LoggingConfig::default(),
        }
    }
}

impl TargetConfig {
    /// Create a configuration rooted at `root` with default limits
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON formatted log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TargetConfig::default();
        assert_eq!(config.root, PathBuf::from("./osd-root"));
        assert_eq!(config.max_output_len, 64 * 1024 * 1024);
        assert_eq!(config.read_map_chunk, 4);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_config_with_root() {
        let config = TargetConfig::with_root("/tmp/osd");
        assert_eq!(config.root, PathBuf::from("/tmp/osd"));
        assert!(config.osd_name.is_none());
    }
}

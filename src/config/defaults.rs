//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for all configuration values.

use std::env;

use serde::{Deserialize, Serialize};

/// Default store location, relative to the home directory.
pub const DEFAULT_CACHE_DIR_NAME: &str = "xcache";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Store root (default: ~/xcache)
    pub cache_root: String,

    /// Entries kept after eviction (default: 10000)
    pub cache_count: u64,

    /// Clear the whole store before resolving (default: false)
    pub clear_all: bool,

    /// Targets with fewer source files are not cached (default: 1)
    pub min_source_file_count: u64,

    /// Treat a module map read by a target as a dependency on its owner (default: true)
    pub detect_module_map_dependency: bool,

    /// Extract all hits in one batched step (default: false)
    pub extract_once: bool,

    /// Per-pass state directory (default: ".xcache")
    pub state_dir: String,

    /// Project manifest path (default: "xcache-project.json")
    pub manifest: String,

    /// Lockfile holding spec checksums (default: "Podfile.lock")
    pub lockfile: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        let cache_root = match env::var("HOME") {
            Ok(home) if !home.is_empty() => format!("{}/{}", home, DEFAULT_CACHE_DIR_NAME),
            _ => format!("~/{}", DEFAULT_CACHE_DIR_NAME),
        };
        Self {
            cache_root,
            cache_count: 10000,
            clear_all: false,
            min_source_file_count: 1,
            detect_module_map_dependency: true,
            extract_once: false,
            state_dir: ".xcache".to_string(),
            manifest: "xcache-project.json".to_string(),
            lockfile: "Podfile.lock".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "cache": {
                "root": self.cache_root,
                "count": self.cache_count,
                "clear_all": self.clear_all
            },
            "targets": {
                "min_source_file_count": self.min_source_file_count,
                "detect_module_map_dependency": self.detect_module_map_dependency
            },
            "extract_once": self.extract_once,
            "state_dir": self.state_dir,
            "project": {
                "manifest": self.manifest,
                "lockfile": self.lockfile
            }
        })
    }
}

//! Effective configuration with full provenance
//!
//! The effective config captures the merged configuration plus
//! information about where each value came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::defaults::BuiltinDefaults;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "xcache/effective_config@1";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = ".xcache.toml";

pub const ENV_CACHE_ROOT: &str = "XCACHE_CACHE_ROOT";
pub const ENV_CACHE_COUNT: &str = "XCACHE_CACHE_COUNT";
pub const ENV_MIN_SOURCE_FILE_COUNT: &str = "XCACHE_MIN_SOURCE_FILE_COUNT";
pub const ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY: &str = "XCACHE_NOT_DETECT_MODULE_MAP_DEPENDENCY";
pub const ENV_EXTRACT_ONCE: &str = "XCACHE_EXTRACT_ONCE";
pub const ENV_CLEAR_ALL: &str = "XCACHE_CLEAR_ALL";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Origin of this source
    pub origin: ConfigOrigin,

    /// File path (None for builtin/env/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/env/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
}

/// Store location and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub root: PathBuf,
    pub count: usize,
    pub clear_all: bool,
}

/// Which targets take part in caching and how they are linked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSettings {
    pub min_source_file_count: usize,
    pub detect_module_map_dependency: bool,
}

/// Where the project description lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub manifest: PathBuf,
    pub lockfile: PathBuf,
}

/// Typed view of the merged configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub cache: StoreSettings,
    pub targets: TargetSettings,
    pub extract_once: bool,
    pub state_dir: PathBuf,
    pub project: ProjectSettings,
}

impl EffectiveConfig {
    /// Build effective config from layers
    pub fn build(
        file_config_path: Option<&Path>,
        env_overrides: Option<Value>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        // Layer 1: Built-in defaults
        let defaults = BuiltinDefaults::default();
        layers.push(defaults.to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        // Layer 2: Config file
        if let Some(path) = file_config_path {
            if path.exists() {
                let (value, digest) = Self::load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            }
        }

        // Layer 3: Environment
        if let Some(env) = env_overrides {
            layers.push(env);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
            });
        }

        // Layer 4: CLI overrides
        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let mut merged = Value::Object(Map::new());
        for layer in layers {
            overlay(&mut merged, layer);
        }
        Self::validate_config(&merged)?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            sources,
        })
    }

    /// Environment layer from `XCACHE_*` variables.
    ///
    /// Counts are honored only when the value is exactly a decimal integer;
    /// switches only when the value is `YES`. Returns None when nothing is set.
    pub fn env_layer<F>(lookup: F) -> Option<Value>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cache = Map::new();
        let mut targets = Map::new();
        let mut layer = Map::new();

        if let Some(root) = lookup(ENV_CACHE_ROOT).filter(|v| !v.is_empty()) {
            cache.insert("root".to_string(), json!(root));
        }
        if let Some(count) = lookup(ENV_CACHE_COUNT).and_then(|v| parse_exact_count(&v)) {
            cache.insert("count".to_string(), json!(count));
        }
        if lookup(ENV_CLEAR_ALL).as_deref() == Some("YES") {
            cache.insert("clear_all".to_string(), json!(true));
        }
        if let Some(min) = lookup(ENV_MIN_SOURCE_FILE_COUNT).and_then(|v| parse_exact_count(&v)) {
            targets.insert("min_source_file_count".to_string(), json!(min));
        }
        if lookup(ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY).as_deref() == Some("YES") {
            targets.insert("detect_module_map_dependency".to_string(), json!(false));
        }
        if lookup(ENV_EXTRACT_ONCE).as_deref() == Some("YES") {
            layer.insert("extract_once".to_string(), json!(true));
        }

        if !cache.is_empty() {
            layer.insert("cache".to_string(), Value::Object(cache));
        }
        if !targets.is_empty() {
            layer.insert("targets".to_string(), Value::Object(targets));
        }
        if layer.is_empty() {
            None
        } else {
            Some(Value::Object(layer))
        }
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;

        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    /// Convert TOML Value to JSON Value
    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Self::toml_to_json).collect())
            }
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// Validate configuration values
    fn validate_config(config: &Value) -> Result<(), ConfigError> {
        match config.pointer("/cache/root").and_then(|v| v.as_str()) {
            Some(root) if !root.is_empty() => {}
            _ => {
                return Err(ConfigError::ValidationError(
                    "cache.root must be a non-empty path".to_string(),
                ))
            }
        }

        for key in ["/cache/count", "/targets/min_source_file_count"] {
            if config.pointer(key).and_then(|v| v.as_u64()).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a non-negative integer",
                    key.trim_start_matches('/').replace('/', ".")
                )));
            }
        }

        Ok(())
    }

    /// Typed settings, with `~/` in the store root expanded.
    pub fn settings(&self) -> Result<CacheSettings, ConfigError> {
        let mut settings: CacheSettings = serde_json::from_value(self.config.clone())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        settings.cache.root = expand_home(&settings.cache.root);
        Ok(settings)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        fs::write(path, json)
    }
}

/// Apply one layer on top of the merged configuration.
///
/// Tables (`[cache]`, `[targets]`, `[project]`) are merged key by key, so a
/// layer that sets only `cache.count` keeps the `cache.root` of the layers
/// below it. Every other value, including null, replaces what was there.
fn overlay(merged: &mut Value, layer: Value) {
    match (merged, layer) {
        (Value::Object(table), Value::Object(layer)) => {
            for (key, value) in layer {
                match table.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_exact_count(value: &str) -> Option<u64> {
    let count = value.parse::<u64>().ok()?;
    (count.to_string() == value).then_some(count)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) if !home.is_empty() => Path::new(&home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> Option<Value> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EffectiveConfig::env_layer(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        let settings = config.settings().unwrap();
        assert_eq!(settings.cache.count, 10000);
        assert!(!settings.extract_once);
        assert_eq!(settings.targets.min_source_file_count, 1);
        assert!(settings.targets.detect_module_map_dependency);
        assert_eq!(settings.state_dir, PathBuf::from(".xcache"));
    }

    #[test]
    fn test_env_layer() {
        let env = env_of(&[
            (ENV_CACHE_ROOT, "/tmp/cache"),
            (ENV_CACHE_COUNT, "25"),
            (ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY, "YES"),
            (ENV_EXTRACT_ONCE, "YES"),
            (ENV_CLEAR_ALL, "yes"),
        ]);
        let config = EffectiveConfig::build(None, env, None).unwrap();
        let settings = config.settings().unwrap();

        assert_eq!(settings.cache.root, PathBuf::from("/tmp/cache"));
        assert_eq!(settings.cache.count, 25);
        assert!(!settings.cache.clear_all, "only YES enables a switch");
        assert!(!settings.targets.detect_module_map_dependency);
        assert!(settings.extract_once);
        assert_eq!(config.sources[1].origin, ConfigOrigin::Env);
    }

    #[test]
    fn test_env_counts_must_parse_exactly() {
        for value in ["12abc", " 12", "+12", "012", "-1", ""] {
            let env = env_of(&[(ENV_CACHE_COUNT, value), (ENV_MIN_SOURCE_FILE_COUNT, value)]);
            assert!(env.is_none(), "{:?} should be ignored", value);
        }
        let env = env_of(&[(ENV_MIN_SOURCE_FILE_COUNT, "0")]);
        let settings = EffectiveConfig::build(None, env, None)
            .unwrap()
            .settings()
            .unwrap();
        assert_eq!(settings.targets.min_source_file_count, 0);
    }

    #[test]
    fn test_empty_cache_root_env_is_ignored() {
        assert!(env_of(&[(ENV_CACHE_ROOT, "")]).is_none());
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_of(&[(ENV_CACHE_COUNT, "25")]);
        let cli = serde_json::json!({"cache": {"count": 3}});
        let config = EffectiveConfig::build(None, env, Some(cli)).unwrap();
        assert_eq!(config.settings().unwrap().cache.count, 3);
        assert_eq!(config.sources.len(), 3);
    }

    #[test]
    fn test_later_layers_update_tables_by_key() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[cache]").unwrap();
        writeln!(temp, "root = \"/Volumes/cache\"").unwrap();
        writeln!(temp, "count = 42").unwrap();
        writeln!(temp, "[targets]").unwrap();
        writeln!(temp, "min_source_file_count = 3").unwrap();

        let env = env_of(&[(ENV_CLEAR_ALL, "YES")]);
        let cli = serde_json::json!({"cache": {"count": 7}, "state_dir": "/tmp/state"});
        let settings = EffectiveConfig::build(Some(temp.path()), env, Some(cli))
            .unwrap()
            .settings()
            .unwrap();

        assert_eq!(settings.cache.root, PathBuf::from("/Volumes/cache"));
        assert_eq!(settings.cache.count, 7);
        assert!(settings.cache.clear_all);
        assert_eq!(settings.targets.min_source_file_count, 3);
        assert!(settings.targets.detect_module_map_dependency);
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/state"));
    }

    #[test]
    fn test_overlay_replaces_non_tables() {
        let mut merged = serde_json::json!({"cache": {"count": 10}});
        overlay(&mut merged, serde_json::json!({"cache": 5}));
        assert_eq!(merged, serde_json::json!({"cache": 5}));
        overlay(&mut merged, serde_json::json!({"cache": {"count": 1}}));
        assert_eq!(merged, serde_json::json!({"cache": {"count": 1}}));
    }

    #[test]
    fn test_validation_cache_count() {
        let cli = serde_json::json!({"cache": {"count": -5}});
        let result = EffectiveConfig::build(None, None, Some(cli));
        assert!(result.unwrap_err().to_string().contains("cache.count"));
    }

    #[test]
    fn test_validation_cache_root() {
        let cli = serde_json::json!({"cache": {"root": ""}});
        let result = EffectiveConfig::build(None, None, Some(cli));
        assert!(result.unwrap_err().to_string().contains("cache.root"));
    }

    #[test]
    fn test_load_toml_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "extract_once = true").unwrap();
        writeln!(temp, "[cache]").unwrap();
        writeln!(temp, "count = 42").unwrap();

        let config = EffectiveConfig::build(Some(temp.path()), None, None).unwrap();

        let settings = config.settings().unwrap();
        assert_eq!(settings.cache.count, 42);
        assert!(settings.extract_once);
        assert_eq!(config.sources[1].origin, ConfigOrigin::File);
        assert_eq!(config.sources[1].digest.as_ref().map(|d| d.len()), Some(64));
    }

    #[test]
    fn test_missing_config_file_is_skipped() {
        let config =
            EffectiveConfig::build(Some(Path::new("/nonexistent/.xcache.toml")), None, None)
                .unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_write_to_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("effective_config.json");
        let config = EffectiveConfig::build(None, None, None).unwrap();
        config.write_to_file(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(SCHEMA_ID));
    }
}

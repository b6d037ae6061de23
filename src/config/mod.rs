//! Configuration merge system
//!
//! Settings are merged from four layers, later layers winning:
//! 1. Built-in defaults
//! 2. Config file (`.xcache.toml` or `--config`)
//! 3. `XCACHE_*` environment variables
//! 4. CLI flags

mod defaults;
mod effective;

pub use defaults::BuiltinDefaults;
pub use effective::{
    CacheSettings, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, ProjectSettings,
    StoreSettings, TargetSettings, DEFAULT_CONFIG_FILE, ENV_CACHE_COUNT, ENV_CACHE_ROOT,
    ENV_CLEAR_ALL, ENV_EXTRACT_ONCE, ENV_MIN_SOURCE_FILE_COUNT,
    ENV_NOT_DETECT_MODULE_MAP_DEPENDENCY,
};

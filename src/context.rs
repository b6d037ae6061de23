//! Per-target state threaded through a build.
//!
//! `pre` creates one [`TargetContext`] per cacheable target and persists it
//! in the state directory; `printenv` adds the build settings of missed
//! targets while the build runs; `post` reads everything back to commit new
//! entries. `clean` removes the state directory.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use xcache_store::{
    BuildDirAliases, Candidate, DependencyFileHash, DependencyTarget, ProductKind,
};

/// Schema version for persisted target contexts
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for persisted target contexts
pub const SCHEMA_ID: &str = "xcache/target_context@1";

/// Directory under the state dir holding target contexts.
const CONTEXTS_DIR_NAME: &str = "contexts";

pub const BUILD_KEY_SYMROOT: &str = "SYMROOT";
pub const BUILD_KEY_TARGET_BUILD_DIR: &str = "TARGET_BUILD_DIR";
pub const BUILD_KEY_OBJROOT: &str = "OBJROOT";
pub const BUILD_KEY_TARGET_TEMP_DIR: &str = "TARGET_TEMP_DIR";
pub const BUILD_KEY_PODS_XCFRAMEWORKS_BUILD_DIR: &str = "PODS_XCFRAMEWORKS_BUILD_DIR";
pub const BUILD_KEY_MODULEMAP_FILE: &str = "MODULEMAP_FILE";
pub const BUILD_KEY_SRCROOT: &str = "SRCROOT";
pub const BUILD_KEY_WRAPPER_NAME: &str = "WRAPPER_NAME";

/// Errors from reading or writing persisted contexts.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// (project, target) key, unique within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub project: String,
    pub target: String,
}

impl TargetId {
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)
    }
}

/// Resolution state of a target within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Unresolved,
    Hit,
    Miss,
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

/// Build settings captured from the build environment of a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BuildSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symroot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_build_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objroot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temp_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_xcframeworks_build_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulemap_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcroot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper_name: Option<String>,
}

impl BuildSettings {
    /// Overwrite every setting `lookup` has a non-empty value for.
    pub fn capture<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = get(BUILD_KEY_SYMROOT) {
            self.symroot = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_TARGET_BUILD_DIR) {
            self.target_build_dir = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_OBJROOT) {
            self.objroot = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_TARGET_TEMP_DIR) {
            self.target_temp_dir = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_PODS_XCFRAMEWORKS_BUILD_DIR) {
            self.pods_xcframeworks_build_dir = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_MODULEMAP_FILE) {
            self.modulemap_file = Some(v);
        }
        if let Some(v) = get(BUILD_KEY_SRCROOT) {
            self.srcroot = Some(v.into());
        }
        if let Some(v) = get(BUILD_KEY_WRAPPER_NAME) {
            self.wrapper_name = Some(v);
        }
    }

    /// Product and intermediate directories relative to SYMROOT and OBJROOT.
    pub fn aliases(&self) -> BuildDirAliases {
        BuildDirAliases {
            target_build_dir_name: strip_root(&self.target_build_dir, &self.symroot),
            target_temp_dir_name: strip_root(&self.target_temp_dir, &self.objroot),
        }
    }
}

fn strip_root(dir: &Option<PathBuf>, root: &Option<PathBuf>) -> Option<String> {
    let dir = dir.as_ref()?;
    let relative = match root {
        Some(root) => dir.strip_prefix(root).unwrap_or(dir),
        None => dir,
    };
    let alias = relative.to_string_lossy().to_string();
    (!alias.is_empty()).then_some(alias)
}

/// Everything known about one target during a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetContext {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub schema_id: String,
    pub id: TargetId,
    pub product_kind: ProductKind,
    pub fingerprint: String,
    #[serde(default)]
    pub status: TargetStatus,
    /// Verified entry directories, newest first
    #[serde(default)]
    pub candidates: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub build_settings: BuildSettings,
    #[serde(default)]
    pub aliases: BuildDirAliases,
    /// Module map relative to the working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_map_file: Option<String>,
    /// External input files, absolute
    #[serde(default)]
    pub dependency_files: Vec<PathBuf>,
    #[serde(default)]
    pub dependency_file_hashes: Vec<DependencyFileHash>,
    #[serde(default)]
    pub dependency_targets: Vec<DependencyTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_hash: Option<String>,
}

impl TargetContext {
    pub fn new(id: TargetId, product_kind: ProductKind, fingerprint: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            id,
            product_kind,
            fingerprint: fingerprint.into(),
            status: TargetStatus::Unresolved,
            candidates: Vec::new(),
            chosen_cache_dir: None,
            build_settings: BuildSettings::default(),
            aliases: BuildDirAliases::default(),
            module_map_file: None,
            dependency_files: Vec::new(),
            dependency_file_hashes: Vec::new(),
            dependency_targets: Vec::new(),
            product_hash: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.id.target
    }

    /// Accept `candidate`; returns false if the status was already terminal.
    ///
    /// The entry's recorded aliases, module map and dependency sets become
    /// this target's.
    pub fn mark_hit(&mut self, candidate: &Candidate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let metadata = &candidate.metadata;
        self.status = TargetStatus::Hit;
        self.chosen_cache_dir = Some(candidate.dir.clone());
        self.aliases = metadata.aliases.clone();
        self.module_map_file = metadata.module_map_file.clone();
        self.dependency_file_hashes = metadata.dependency_files.clone();
        self.dependency_targets = metadata.dependency_targets.clone();
        self.product_hash = Some(metadata.product_hash.clone());
        true
    }

    /// Returns false if the status was already terminal.
    pub fn mark_miss(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TargetStatus::Miss;
        true
    }
}

/// Persisted contexts under `<state_dir>/contexts/<project path>/<target>.json`.
#[derive(Debug, Clone)]
pub struct ContextStore {
    state_dir: PathBuf,
}

impl ContextStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Contexts are keyed on the whole project path, so projects sharing a
    /// file name in different directories stay apart. Only normal components
    /// are kept, which keeps the result inside the state directory.
    pub fn path_for(&self, id: &TargetId) -> PathBuf {
        let project: PathBuf = Path::new(&id.project)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();
        self.state_dir
            .join(CONTEXTS_DIR_NAME)
            .join(project)
            .join(format!("{}.json", id.target))
    }

    pub fn save(&self, context: &TargetContext) -> Result<(), ContextError> {
        let path = self.path_for(&context.id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ContextError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(context).map_err(|source| ContextError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| ContextError::Io { path, source })
    }

    /// Load a context; None if the target has none in this build.
    pub fn load(&self, id: &TargetId) -> Result<Option<TargetContext>, ContextError> {
        let path = self.path_for(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ContextError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ContextError::Json { path, source })
    }

    /// Remove all persisted state.
    pub fn clear(&self) -> Result<(), ContextError> {
        match fs::remove_dir_all(&self.state_dir) {
            Ok(()) => {
                debug!("removed {}", self.state_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ContextError::Io {
                path: self.state_dir.clone(),
                source,
            }),
        }
    }
}

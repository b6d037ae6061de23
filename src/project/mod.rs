//! Project model.
//!
//! The cache only needs a narrow view of the native project: its build
//! configurations, its targets and the files each target compiles. Anything
//! that can describe that implements [`ProjectModel`].

mod manifest;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;
use xcache_store::ProductKind;

pub use manifest::{ManifestProjectModel, MANIFEST_SCHEMA_ID, MANIFEST_SCHEMA_VERSION};

/// Project result type
pub type ProjectResult<T> = Result<T, ProjectError>;

/// Errors from loading project descriptions.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Lockfile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported manifest schema version {0}")]
    UnsupportedSchema(u32),
}

/// Targets whose names start with this prefix aggregate other targets and
/// are never cached.
pub const AGGREGATE_TARGET_PREFIX: &str = "Pods-";

/// A named build configuration (e.g. "Debug").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfiguration {
    pub name: String,
    /// Build settings; values are strings or string lists
    #[serde(default)]
    pub build_settings: BTreeMap<String, serde_json::Value>,
    /// Base xcconfig file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_configuration: Option<PathBuf>,
}

/// Per-file compiler settings attached to a build file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSettings {
    pub path: PathBuf,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// A native target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// Xcode product type identifier
    pub product_type: String,
    #[serde(default)]
    pub build_configurations: Vec<BuildConfiguration>,
    #[serde(default)]
    pub source_files: Vec<PathBuf>,
    #[serde(default)]
    pub header_files: Vec<PathBuf>,
    #[serde(default)]
    pub resource_files: Vec<PathBuf>,
    #[serde(default)]
    pub file_settings: Vec<FileSettings>,
}

impl Target {
    /// Product kind, if the product type is one the cache handles.
    pub fn product_kind(&self) -> Option<ProductKind> {
        ProductKind::from_product_type(&self.product_type)
    }

    /// Whether this target takes part in caching at all.
    pub fn is_cacheable(&self) -> bool {
        !self.name.starts_with(AGGREGATE_TARGET_PREFIX) && self.product_kind().is_some()
    }

    pub fn configuration(&self, name: &str) -> Option<&BuildConfiguration> {
        self.build_configurations.iter().find(|c| c.name == name)
    }

    /// Every file the target builds from.
    ///
    /// Source, header and resource files in that order; directories are
    /// expanded to the files below them and paths that do not exist are
    /// skipped. Duplicates keep their first position.
    pub fn collect_source_files(&self) -> Vec<PathBuf> {
        let declared = self
            .source_files
            .iter()
            .chain(&self.header_files)
            .chain(&self.resource_files);

        let mut files = Vec::new();
        for path in unique(declared.cloned()) {
            if path.is_file() {
                files.push(path);
            } else if path.is_dir() {
                let walker = WalkDir::new(&path)
                    .sort_by(|a, b| a.file_name().cmp(b.file_name()))
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file());
                files.extend(walker.map(|e| e.into_path()));
            }
        }
        unique(files)
    }
}

/// A native project and its targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Path of the project bundle (e.g. `Pods/Pods.xcodeproj`)
    pub path: PathBuf,
    #[serde(default)]
    pub build_configurations: Vec<BuildConfiguration>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Project {
    /// Project file name, e.g. `Pods.xcodeproj`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Identifier used to key per-target state.
    pub fn id(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn configuration(&self, name: &str) -> Option<&BuildConfiguration> {
        self.build_configurations.iter().find(|c| c.name == name)
    }
}

/// Source of project descriptions.
pub trait ProjectModel {
    /// All projects taking part in the build, in a stable order.
    fn projects(&self) -> &[Project];
}

fn unique<I: IntoIterator<Item = PathBuf>>(paths: I) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Resolve `path` against `base` unless it is already absolute.
pub(crate) fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn target(name: &str, product_type: &str) -> Target {
        Target {
            name: name.to_string(),
            product_type: product_type.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cacheable_targets() {
        assert!(target("AFNetworking", "com.apple.product-type.library.static").is_cacheable());
        assert!(target("Resources", "com.apple.product-type.bundle").is_cacheable());
        assert!(!target("Pods-App", "com.apple.product-type.library.static").is_cacheable());
        assert!(!target("App", "com.apple.product-type.application").is_cacheable());
    }

    #[test]
    fn test_collect_source_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.m"), "a").unwrap();
        fs::write(root.join("a.h"), "a").unwrap();
        fs::create_dir_all(root.join("Assets.xcassets/icon.imageset")).unwrap();
        fs::write(root.join("Assets.xcassets/icon.imageset/Contents.json"), "{}").unwrap();
        fs::write(root.join("Assets.xcassets/Contents.json"), "{}").unwrap();

        let mut t = target("Foo", "com.apple.product-type.library.static");
        t.source_files = vec![root.join("a.m"), root.join("missing.m")];
        t.header_files = vec![root.join("a.h"), root.join("a.m")];
        t.resource_files = vec![root.join("Assets.xcassets")];

        let files = t.collect_source_files();
        assert_eq!(
            files,
            vec![
                root.join("a.m"),
                root.join("a.h"),
                root.join("Assets.xcassets/Contents.json"),
                root.join("Assets.xcassets/icon.imageset/Contents.json"),
            ]
        );
    }

    #[test]
    fn test_project_file_name() {
        let project = Project {
            path: PathBuf::from("/work/Pods/Pods.xcodeproj"),
            ..Default::default()
        };
        assert_eq!(project.file_name(), "Pods.xcodeproj");
        assert_eq!(project.id(), "/work/Pods/Pods.xcodeproj");
    }
}

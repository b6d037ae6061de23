//! JSON project manifest.
//!
//! The manifest is written by the project tooling and lists every project
//! taking part in the build. Relative paths are resolved against the
//! directory holding the manifest.
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "projects": [{
//!     "path": "Pods/Pods.xcodeproj",
//!     "build_configurations": [{"name": "Debug", "build_settings": {}}],
//!     "targets": [{
//!       "name": "AFNetworking",
//!       "product_type": "com.apple.product-type.library.static",
//!       "build_configurations": [{"name": "Debug", "base_configuration": "Pods/Target Support Files/AFNetworking/AFNetworking.debug.xcconfig"}],
//!       "source_files": ["Pods/AFNetworking/AFNetworking/AFURLSessionManager.m"],
//!       "header_files": ["Pods/AFNetworking/AFNetworking/AFURLSessionManager.h"]
//!     }]
//!   }]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{resolve_path, Project, ProjectError, ProjectModel, ProjectResult};

/// Schema version for project manifests
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for project manifests
pub const MANIFEST_SCHEMA_ID: &str = "xcache/project_manifest@1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    projects: Vec<Project>,
}

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

/// Project model backed by a JSON manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestProjectModel {
    projects: Vec<Project>,
}

impl ManifestProjectModel {
    /// Load a manifest file.
    pub fn load(path: &Path) -> ProjectResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|source| ProjectError::Manifest {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(ProjectError::UnsupportedSchema(manifest.schema_version));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let projects: Vec<Project> = manifest
            .projects
            .into_iter()
            .map(|project| absolutize(base, project))
            .collect();

        debug!(
            "loaded {} projects with {} targets from {}",
            projects.len(),
            projects.iter().map(|p| p.targets.len()).sum::<usize>(),
            path.display()
        );
        Ok(Self { projects })
    }

    /// Model over already resolved projects.
    pub fn from_projects(projects: Vec<Project>) -> Self {
        Self { projects }
    }
}

impl ProjectModel for ManifestProjectModel {
    fn projects(&self) -> &[Project] {
        &self.projects
    }
}

fn absolutize(base: &Path, mut project: Project) -> Project {
    project.path = resolve_path(base, &project.path);

    let configurations = project.build_configurations.iter_mut().chain(
        project
            .targets
            .iter_mut()
            .flat_map(|t| t.build_configurations.iter_mut()),
    );
    for configuration in configurations {
        if let Some(xcconfig) = configuration.base_configuration.take() {
            configuration.base_configuration = Some(resolve_path(base, &xcconfig));
        }
    }

    for target in &mut project.targets {
        for file in target
            .source_files
            .iter_mut()
            .chain(target.header_files.iter_mut())
            .chain(target.resource_files.iter_mut())
        {
            *file = resolve_path(base, file);
        }
        for file in &mut target.file_settings {
            file.path = resolve_path(base, &file.path);
        }
    }
    project
}

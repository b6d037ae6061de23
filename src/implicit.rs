//! Implicit target dependencies.
//!
//! Targets routinely read each other's outputs (public headers copied into
//! the products directory, generated Swift headers, module maps) without the
//! project declaring an edge. A file of one target that lives in another
//! target's build directories is turned into a link to that target's
//! fingerprint, which is both more precise and portable across build roots.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use xcache_store::{DependencyFileHash, DependencyTarget, FileHashCache};

use crate::context::TargetContext;
use crate::depfile::is_inside;
use crate::fingerprint::PathStripper;

/// Result of reclassifying a target's dependency files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImplicitDependencies {
    /// Files not owned by any other target
    pub files: Vec<PathBuf>,
    /// Targets the remaining files were traced to, first-seen order
    pub targets: Vec<DependencyTarget>,
}

/// Trace `target`'s dependency files to the other targets in `all`.
///
/// For each other target (resource bundles on either side are skipped), a
/// file is matched against, in order: its product dir, its intermediate dir,
/// `SYMROOT/<its product alias>` and `OBJROOT/<its intermediate alias>`,
/// with SYMROOT and OBJROOT taken from `target`. The first match links the
/// target and removes the file. Independently, when `detect_module_maps` is
/// set, a file equal to `<working_dir>/<its module map>` links the target
/// but keeps the file.
pub fn detect(
    target: &TargetContext,
    all: &[TargetContext],
    working_dir: &Path,
    detect_module_maps: bool,
) -> ImplicitDependencies {
    let mut files = target.dependency_files.clone();
    let mut targets = Vec::new();
    let mut linked = HashSet::new();

    if target.product_kind.is_resource_bundle() {
        return ImplicitDependencies { files, targets };
    }

    let symroot = target.build_settings.symroot.as_deref();
    let objroot = target.build_settings.objroot.as_deref();

    for other in all {
        if other.id == target.id || other.product_kind.is_resource_bundle() {
            continue;
        }

        let owned_dirs = owned_dirs(other, symroot, objroot);
        let module_map = other
            .module_map_file
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| working_dir.join(m));

        let mut matched = false;
        let mut reclassified = HashSet::new();
        for file in &files {
            if owned_dirs.iter().any(|dir| is_inside(file, dir)) {
                matched = true;
                reclassified.insert(file.clone());
            }
            if detect_module_maps && module_map.as_ref() == Some(file) {
                matched = true;
            }
        }

        if matched && linked.insert(other.id.clone()) {
            targets.push(DependencyTarget {
                name: other.name().to_string(),
                fingerprint: other.fingerprint.clone(),
            });
        }
        files.retain(|file| !reclassified.contains(file));
    }

    ImplicitDependencies { files, targets }
}

/// Directories whose contents belong to `other`, in match order.
fn owned_dirs(other: &TargetContext, symroot: Option<&Path>, objroot: Option<&Path>) -> Vec<PathBuf> {
    let settings = &other.build_settings;
    let mut dirs = Vec::new();
    dirs.extend(non_empty(settings.target_build_dir.as_deref()).map(Path::to_path_buf));
    dirs.extend(non_empty(settings.target_temp_dir.as_deref()).map(Path::to_path_buf));
    if let (Some(root), Some(alias)) = (symroot, other.aliases.target_build_dir_name.as_deref()) {
        if !alias.is_empty() {
            dirs.push(root.join(alias));
        }
    }
    if let (Some(root), Some(alias)) = (objroot, other.aliases.target_temp_dir_name.as_deref()) {
        if !alias.is_empty() {
            dirs.push(root.join(alias));
        }
    }
    dirs
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Hash the remaining dependency files, recording working-directory-relative
/// paths, sorted and unique.
pub fn hash_dependency_files(
    files: &[PathBuf],
    stripper: &PathStripper,
    hashes: &FileHashCache,
) -> std::io::Result<Vec<DependencyFileHash>> {
    let mut recorded = Vec::with_capacity(files.len());
    for file in files {
        recorded.push(DependencyFileHash {
            path: stripper.strip_path(file),
            md5: hashes.md5(file)?,
        });
    }
    recorded.sort();
    recorded.dedup();
    Ok(recorded)
}

//! Compiler dependency records.
//!
//! Every compile step of a target leaves a make-style `*.d` file in the
//! target's intermediate directory listing the files it read. Together they
//! name the target's true inputs, including headers of other targets and
//! system files that no project setting mentions.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use xcache_store::ProductKind;

/// Tokens that are make rule syntax rather than paths.
const RULE_TOKENS: &[&str] = &["dependencies:", "\\", ":"];

/// Errors from dependency extraction
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("{target} {file} should exist in dependency file {record}")]
    MissingFile {
        target: String,
        file: PathBuf,
        record: PathBuf,
    },

    #[error("{target} should have dependent files")]
    NoDependencies { target: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to scan intermediate directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Split dependency record text into paths.
///
/// Tokens are separated by whitespace; `\ ` is an escaped space inside a
/// path. Rule syntax and rule targets (`foo.o:`) are dropped.
pub fn tokenize(content: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&' ') {
            chars.next();
            current.push_str("\\ ");
        } else if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut seen = HashSet::new();
    tokens
        .into_iter()
        .filter(|t| !RULE_TOKENS.contains(&t.as_str()) && !t.ends_with(':'))
        .filter(|t| seen.insert(t.clone()))
        .map(|t| t.replace("\\ ", " "))
        .collect()
}

/// Directories whose contents are the target's own outputs.
#[derive(Debug, Clone, Copy)]
pub struct OwnBuildDirs<'a> {
    pub intermediate_dir: &'a Path,
    pub product_dir: &'a Path,
    pub xcframeworks_dir: Option<&'a Path>,
}

impl OwnBuildDirs<'_> {
    fn contains(&self, file: &Path) -> bool {
        is_inside(file, self.intermediate_dir)
            || is_inside(file, self.product_dir)
            || self.xcframeworks_dir.map_or(false, |dir| is_inside(file, dir))
    }
}

/// Whether `file` lies strictly below `dir`; the directory itself is not inside.
pub(crate) fn is_inside(file: &Path, dir: &Path) -> bool {
    file != dir && file.starts_with(dir)
}

/// Every file named by the `*.d` records under the intermediate directory,
/// minus the target's own outputs, in first-seen order.
///
/// A named file that does not exist means the records are stale or corrupt;
/// the whole extraction fails.
pub fn extract_dependencies(
    target: &str,
    dirs: OwnBuildDirs<'_>,
) -> Result<Vec<PathBuf>, DependencyError> {
    if !dirs.intermediate_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    let records = WalkDir::new(dirs.intermediate_dir)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter();

    for entry in records {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "d") {
            continue;
        }
        let content = fs::read_to_string(path).map_err(|source| DependencyError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        for token in tokenize(&content) {
            let file = PathBuf::from(token);
            if !file.exists() {
                return Err(DependencyError::MissingFile {
                    target: target.to_string(),
                    file,
                    record: path.to_path_buf(),
                });
            }
            if dirs.contains(&file) {
                continue;
            }
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }
    Ok(files)
}

/// Apply the completeness policy and drop the target's own sources.
///
/// A target that compiled something must have left dependency records;
/// resource bundles compile nothing and are exempt.
pub fn external_dependencies(
    target: &str,
    kind: ProductKind,
    source_files: &[PathBuf],
    dependencies: Vec<PathBuf>,
) -> Result<Vec<PathBuf>, DependencyError> {
    if !source_files.is_empty() && dependencies.is_empty() && !kind.is_resource_bundle() {
        return Err(DependencyError::NoDependencies {
            target: target.to_string(),
        });
    }
    let sources: HashSet<&PathBuf> = source_files.iter().collect();
    Ok(dependencies
        .into_iter()
        .filter(|file| !sources.contains(file))
        .collect())
}

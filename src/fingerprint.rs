//! Target fingerprints.
//!
//! A fingerprint is the MD5 of a labeled, line-oriented text describing
//! everything that decides what a target builds into. The text is stored
//! next to each cache entry so a surprising miss can be diffed by hand.
//!
//! Absolute paths under the working directory are written relative to it,
//! so the same checkout in two locations fingerprints identically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use xcache_argv::filter_cache_key_args;
use xcache_store::{md5_hex, FileHashCache};

use crate::checksums::SpecChecksums;
use crate::project::{BuildConfiguration, Project, Target};

/// Version recorded in every fingerprint. Bumping it invalidates all entries.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lines of xcconfig files containing this marker are machine specific.
const SEARCH_PATHS_MARKER: &str = "_SEARCH_PATHS";

/// Errors from fingerprint computation
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("{owner} configuration {configuration} should exist")]
    MissingConfiguration { owner: String, configuration: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to render settings: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("failed to render arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    #[error("invalid working directory pattern: {0}")]
    Pattern(#[from] regex_lite::Error),
}

/// A computed fingerprint and the text it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// 128-bit hex digest
    pub hash: String,
    /// Canonical content
    pub content: String,
}

/// Removes the working directory from paths and text.
#[derive(Debug, Clone)]
pub struct PathStripper {
    working_dir: PathBuf,
    prefix: String,
    pattern: Regex,
}

impl PathStripper {
    pub fn new(working_dir: &Path) -> Result<Self, FingerprintError> {
        let pwd = working_dir.to_string_lossy().to_string();
        let pattern = Regex::new(&format!(r"{}(\W|$)", regex_lite::escape(&pwd)))?;
        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            prefix: format!("{}/", pwd),
            pattern,
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Drop `<pwd>/`, then `<pwd>` followed by a non-word character or the
    /// end of the text (keeping that character).
    pub fn strip(&self, content: &str) -> String {
        let without_prefix = content.replace(&self.prefix, "");
        self.pattern
            .replace_all(&without_prefix, "${1}")
            .into_owned()
    }

    pub fn strip_path(&self, path: &Path) -> String {
        self.strip(&path.to_string_lossy())
    }
}

/// Computes fingerprints for one pass.
pub struct FingerprintComputer<'a> {
    stripper: &'a PathStripper,
    checksums: &'a SpecChecksums,
    hashes: &'a FileHashCache,
}

impl<'a> FingerprintComputer<'a> {
    pub fn new(
        stripper: &'a PathStripper,
        checksums: &'a SpecChecksums,
        hashes: &'a FileHashCache,
    ) -> Self {
        Self {
            stripper,
            checksums,
            hashes,
        }
    }

    /// Fingerprint `target` of `project` for `configuration`.
    ///
    /// `argv` is the full build invocation; machine-local path arguments are
    /// filtered out. `source_files` are absolute paths.
    pub fn compute(
        &self,
        project: &Project,
        target: &Target,
        configuration: &str,
        argv: &[String],
        source_files: &[PathBuf],
    ) -> Result<Fingerprint, FingerprintError> {
        let project_configuration =
            project
                .configuration(configuration)
                .ok_or_else(|| FingerprintError::MissingConfiguration {
                    owner: project.file_name(),
                    configuration: configuration.to_string(),
                })?;
        let target_configuration =
            target
                .configuration(configuration)
                .ok_or_else(|| FingerprintError::MissingConfiguration {
                    owner: target.name.clone(),
                    configuration: configuration.to_string(),
                })?;

        let mut lines = vec![
            format!("Version : {}", TOOL_VERSION),
            format!(
                "ARGV : {}",
                serde_json::to_string(&filter_cache_key_args(argv))?
            ),
        ];

        let spec_checksums = self.checksums.matching(&target.name);
        if spec_checksums.is_empty() {
            warn!("{} SPEC CHECKSUM should be found", target.name);
        }
        for (spec_name, checksum) in spec_checksums {
            lines.push(format!("SPEC CHECKSUM : {} {}", spec_name, checksum));
        }

        lines.push(format!("Project : {}", project.file_name()));
        lines.push("Project configuration : ".to_string());
        lines.push(dump_configuration(project_configuration)?);
        lines.push("Project xcconfig : ".to_string());
        lines.push(read_xcconfig(project_configuration)?);
        lines.push(format!("Target : {}", target.name));
        lines.push(format!("Target type : {}", target.product_type));
        lines.push("Target configuration : ".to_string());
        lines.push(dump_configuration(target_configuration)?);
        lines.push("Target xcconfig : ".to_string());
        lines.push(read_xcconfig(target_configuration)?);
        lines.push("Files settings : ".to_string());
        lines.push(dump_file_settings(target)?);

        lines.push("Files MD5 : ".to_string());
        let mut files: Vec<&PathBuf> = source_files.iter().collect();
        files.sort();
        files.dedup();
        for file in files {
            let md5 = self.hashes.md5(file).map_err(|source| FingerprintError::Io {
                path: file.clone(),
                source,
            })?;
            lines.push(format!("{} : {}", self.stripper.strip_path(file), md5));
        }

        let content = lines.join("\n");
        Ok(Fingerprint {
            hash: md5_hex(&content),
            content,
        })
    }
}

#[derive(Serialize)]
struct ConfigurationDump<'a> {
    #[serde(rename = "Build Settings")]
    build_settings: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

/// Settings of a configuration rendered as YAML, keyed by its name.
fn dump_configuration(configuration: &BuildConfiguration) -> Result<String, FingerprintError> {
    let mut root = std::collections::BTreeMap::new();
    root.insert(
        configuration.name.as_str(),
        ConfigurationDump {
            build_settings: &configuration.build_settings,
        },
    );
    Ok(serde_yaml::to_string(&root)?.trim().to_string())
}

/// Base xcconfig lines without search paths, sorted.
fn read_xcconfig(configuration: &BuildConfiguration) -> Result<String, FingerprintError> {
    let Some(path) = configuration.base_configuration.as_ref() else {
        return Ok(String::new());
    };
    if !path.exists() {
        return Ok(String::new());
    }
    let content = fs::read_to_string(path).map_err(|source| FingerprintError::Io {
        path: path.clone(),
        source,
    })?;
    let mut lines: Vec<&str> = content
        .split_inclusive('\n')
        .filter(|line| !line.contains(SEARCH_PATHS_MARKER))
        .collect();
    lines.sort_unstable();
    Ok(lines.concat().trim().to_string())
}

/// Per-file overrides as `<basename>\n<yaml>`, sorted and deduplicated.
fn dump_file_settings(target: &Target) -> Result<String, FingerprintError> {
    let mut entries = Vec::new();
    for file in &target.file_settings {
        if file.settings.is_empty() {
            continue;
        }
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        entries.push(format!("{}\n{}", name, serde_yaml::to_string(&file.settings)?));
    }
    entries.sort();
    entries.dedup();
    Ok(entries.join("\n").trim().to_string())
}

//! Spec checksums from the dependency lockfile.
//!
//! The lockfile maps each pod spec to a checksum under `SPEC CHECKSUMS`.
//! Target names do not map to spec names one to one (`AFNetworking-iOS`,
//! `Firebase-Core-Internal`), so every hyphen prefix of a target name is
//! looked up and all matches take part in the fingerprint.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::project::{ProjectError, ProjectResult};

/// Lockfile key holding the checksum table.
pub const SPEC_CHECKSUMS_KEY: &str = "SPEC CHECKSUMS";

/// Spec name to checksum table, loaded once per pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecChecksums {
    checksums: BTreeMap<String, String>,
}

impl SpecChecksums {
    /// Load the table from a lockfile. A missing lockfile yields an empty table.
    pub fn load(path: &Path) -> ProjectResult<Self> {
        if !path.exists() {
            debug!("{} not found, no spec checksums", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ProjectError::Lockfile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse lockfile YAML.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        let lockfile: serde_yaml::Value = serde_yaml::from_str(content)?;
        let mut checksums = BTreeMap::new();
        if let Some(table) = lockfile.get(SPEC_CHECKSUMS_KEY).and_then(|v| v.as_mapping()) {
            for (name, checksum) in table {
                if let (Some(name), Some(checksum)) = (name.as_str(), scalar_to_string(checksum)) {
                    checksums.insert(name.to_string(), checksum);
                }
            }
        }
        Ok(Self { checksums })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            checksums: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, spec_name: &str) -> Option<&str> {
        self.checksums.get(spec_name).map(String::as_str)
    }

    /// `(spec name, checksum)` for every hyphen prefix of `target_name`
    /// found in the table, shortest prefix first.
    pub fn matching(&self, target_name: &str) -> Vec<(String, &str)> {
        let parts: Vec<&str> = target_name.split('-').collect();
        (1..=parts.len())
            .filter_map(|n| {
                let spec_name = parts[..n].join("-");
                let checksum = self.get(&spec_name)?;
                Some((spec_name, checksum))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

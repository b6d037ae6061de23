//! Cache entry layout and metadata.
//!
//! Layout: `<root>/<target>-<fingerprint>-<created_millis>/`
//! - `product.tar`  - the archived build product
//! - `context.json` - [`EntryMetadata`]
//! - `message.txt`  - the canonical fingerprint content
//!
//! A directory without both `product.tar` and `context.json` is never a
//! valid entry.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Product archive file name.
pub const PRODUCT_FILE_NAME: &str = "product.tar";

/// Metadata file name.
pub const METADATA_FILE_NAME: &str = "context.json";

/// Fingerprint content file name.
pub const MESSAGE_FILE_NAME: &str = "message.txt";

/// Schema version for context.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for context.json
pub const SCHEMA_ID: &str = "xcache/entry@1";

/// Kind of product a target builds.
///
/// Serialized as the Xcode product type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductKind {
    #[serde(rename = "com.apple.product-type.library.static")]
    StaticLibrary,
    #[serde(rename = "com.apple.product-type.framework")]
    Framework,
    #[serde(rename = "com.apple.product-type.bundle")]
    Bundle,
}

impl ProductKind {
    /// Parse an Xcode product type identifier. Uncacheable types yield None.
    pub fn from_product_type(product_type: &str) -> Option<Self> {
        match product_type {
            "com.apple.product-type.library.static" => Some(Self::StaticLibrary),
            "com.apple.product-type.framework" => Some(Self::Framework),
            "com.apple.product-type.bundle" => Some(Self::Bundle),
            _ => None,
        }
    }

    /// The Xcode product type identifier.
    pub fn as_product_type(&self) -> &'static str {
        match self {
            Self::StaticLibrary => "com.apple.product-type.library.static",
            Self::Framework => "com.apple.product-type.framework",
            Self::Bundle => "com.apple.product-type.bundle",
        }
    }

    /// Resource bundles compile nothing and never take part in implicit
    /// dependency detection.
    pub fn is_resource_bundle(&self) -> bool {
        matches!(self, Self::Bundle)
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_product_type())
    }
}

/// Recorded hash of an external input file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyFileHash {
    /// Path relative to the working directory when it lies inside it,
    /// absolute otherwise.
    pub path: String,
    /// MD5 of the file contents
    pub md5: String,
}

/// Recorded fingerprint of a dependency target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyTarget {
    pub name: String,
    pub fingerprint: String,
}

/// Build directories with their SYMROOT/OBJROOT prefix stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDirAliases {
    /// TARGET_BUILD_DIR relative to SYMROOT (e.g., "Debug-iphonesimulator/Foo")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_build_dir_name: Option<String>,
    /// TARGET_TEMP_DIR relative to OBJROOT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temp_dir_name: Option<String>,
}

/// Metadata persisted in `context.json`.
///
/// Unknown fields are ignored and missing optional fields default, so
/// entries written by older versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub schema_id: String,
    /// Fingerprint of the target when the entry was created
    pub fingerprint: String,
    /// SHA-256 of `product.tar`
    #[serde(default)]
    pub product_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_kind: Option<ProductKind>,
    /// External input files and their hashes, sorted
    #[serde(default)]
    pub dependency_files: Vec<DependencyFileHash>,
    /// Dependency targets and their fingerprints at creation time
    #[serde(default)]
    pub dependency_targets: Vec<DependencyTarget>,
    #[serde(default)]
    pub aliases: BuildDirAliases,
    /// Module map path relative to the working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_map_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    /// New metadata for a fingerprint; the product hash is filled in on commit.
    pub fn new(fingerprint: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            fingerprint: fingerprint.to_string(),
            product_hash: String::new(),
            product_kind: None,
            dependency_files: Vec::new(),
            dependency_targets: Vec::new(),
            aliases: BuildDirAliases::default(),
            module_map_file: None,
            wrapper_name: None,
            created_at: None,
        }
    }

    /// Read `context.json` from an entry directory.
    pub fn read(entry_dir: &Path) -> StoreResult<Self> {
        let content = fs::read_to_string(entry_dir.join(METADATA_FILE_NAME))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `context.json` into a directory.
    pub fn write(&self, dir: &Path) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(METADATA_FILE_NAME), json)?;
        Ok(())
    }
}

/// Parsed entry directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub target: String,
    pub fingerprint: String,
    pub created_millis: i64,
}

impl EntryName {
    pub fn new(target: &str, fingerprint: &str, created_millis: i64) -> Self {
        Self {
            target: target.to_string(),
            fingerprint: fingerprint.to_string(),
            created_millis,
        }
    }

    /// Parse `<target>-<fingerprint>-<millis>`.
    ///
    /// Target names may contain hyphens; fingerprints and timestamps never do.
    pub fn parse(dir_name: &str) -> StoreResult<Self> {
        let invalid = || StoreError::InvalidEntryName(dir_name.to_string());
        let mut parts = dir_name.rsplitn(3, '-');
        let millis = parts.next().ok_or_else(invalid)?;
        let fingerprint = parts.next().ok_or_else(invalid)?;
        let target = parts.next().ok_or_else(invalid)?;

        if target.is_empty() || fingerprint.is_empty() {
            return Err(invalid());
        }
        if !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let created_millis = millis.parse::<i64>().map_err(|_| invalid())?;

        Ok(Self::new(target, fingerprint, created_millis))
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.target, self.fingerprint, self.created_millis)
    }
}

//! Content hashing.
//!
//! File contents are identified by MD5 (128-bit, hex) everywhere a hash
//! becomes part of a fingerprint or a recorded dependency. Product archives
//! are additionally protected by a SHA-256 digest.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use md5::Md5;
use sha2::{Digest, Sha256};

/// MD5 of a string, hex encoded.
pub fn md5_hex(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// MD5 of a file's contents, hex encoded.
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Memoized file hashes for one pass.
///
/// A file is hashed at most once per pass no matter how many targets list
/// it. The cache is dropped with the pass, so edits made between passes are
/// always observed.
#[derive(Debug, Default)]
pub struct FileHashCache {
    hashes: Mutex<HashMap<PathBuf, String>>,
}

impl FileHashCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// MD5 of `path`, computed on first use.
    pub fn md5(&self, path: &Path) -> io::Result<String> {
        if let Some(hash) = self.lock().get(path) {
            return Ok(hash.clone());
        }
        let hash = md5_file(path)?;
        self.lock().insert(path.to_path_buf(), hash.clone());
        Ok(hash)
    }

    /// Number of distinct files hashed so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been hashed yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, String>> {
        self.hashes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_md5_hex_known_value() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_md5_file_matches_string_hash() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.m");
        fs::write(&path, "abc").unwrap();
        assert_eq!(md5_file(&path).unwrap(), md5_hex("abc"));
    }

    #[test]
    fn test_sha256_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("product.tar");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_cache_memoizes_within_pass() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.h");
        fs::write(&path, "first").unwrap();

        let cache = FileHashCache::new();
        let first = cache.md5(&path).unwrap();
        fs::write(&path, "second").unwrap();
        let again = cache.md5(&path).unwrap();

        assert_eq!(first, again, "hash is memoized for the pass");
        assert_eq!(cache.len(), 1);

        let fresh = FileHashCache::new();
        assert_ne!(fresh.md5(&path).unwrap(), first);
    }

    #[test]
    fn test_cache_missing_file() {
        let cache = FileHashCache::new();
        assert!(cache.md5(Path::new("/nonexistent/xcache/file")).is_err());
        assert!(cache.is_empty());
    }
}

//! The on-disk cache store.
//!
//! Entries are write-once and delete-whole. A commit stages the complete
//! entry under `<root>/.staging/` and renames it into place, so a reader
//! never sees an entry directory before both required files are present.
//! Entry names carry a creation timestamp, so independent writers sharing a
//! root do not collide.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use filetime::FileTime;
use tracing::{debug, error, warn};

use crate::archive::{rewrite_module_maps, unpack_archive, write_archive, ArchivePlan};
use crate::entry::{
    EntryMetadata, EntryName, ProductKind, MESSAGE_FILE_NAME, METADATA_FILE_NAME,
    PRODUCT_FILE_NAME,
};
use crate::error::{StoreError, StoreResult};
use crate::hash::{sha256_file, FileHashCache};

/// Directory under the root holding in-progress commits.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Attempts made before a failed deletion becomes fatal.
pub const REMOVE_ATTEMPTS: u32 = 5;

/// A directory in the store root.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// A verified entry that may satisfy a target.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub dir: PathBuf,
    pub metadata: EntryMetadata,
}

/// Everything needed to commit a freshly built product.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub target: &'a str,
    pub kind: ProductKind,
    /// TARGET_BUILD_DIR of the build that produced the product
    pub product_dir: &'a Path,
    pub wrapper_name: Option<&'a str>,
    /// Metadata to persist; `product_hash` and `created_at` are set by the store
    pub metadata: EntryMetadata,
    /// Canonical fingerprint content
    pub message: &'a str,
}

/// Content-addressed directory store.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Maximum number of verified candidates kept per target.
    pub const MAX_CANDIDATES: usize = 10;

    /// Open a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All entry directories, most recently modified first.
    pub fn list_entries(&self) -> StoreResult<Vec<StoredEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Removed by a concurrent evictor
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_dir() {
                continue;
            }
            entries.push(StoredEntry {
                path: entry.path(),
                modified: metadata.modified()?,
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    /// Find and verify entries for `target` at `fingerprint`.
    ///
    /// Newest first. A candidate whose recorded dependency files no longer
    /// match is skipped and kept; a candidate whose own fingerprint or product
    /// hash fails verification is corrupt and deleted. Collection stops at
    /// [`Self::MAX_CANDIDATES`] or at the first candidate without dependency
    /// targets, which can never be beaten by an older one.
    ///
    /// Relative dependency paths are resolved against `working_dir`.
    pub fn find_candidates(
        &self,
        target: &str,
        fingerprint: &str,
        working_dir: &Path,
        hashes: &FileHashCache,
    ) -> StoreResult<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for entry in self.list_entries()? {
            let matches = entry
                .path
                .file_name()
                .and_then(|n| EntryName::parse(&n.to_string_lossy()).ok())
                .map_or(false, |n| n.target == target && n.fingerprint == fingerprint);
            if !matches {
                continue;
            }
            if !entry.path.join(PRODUCT_FILE_NAME).exists()
                || !entry.path.join(METADATA_FILE_NAME).exists()
            {
                continue;
            }

            let metadata = match EntryMetadata::read(&entry.path) {
                Ok(m) => m,
                Err(e) => {
                    error!("{} {} metadata should be readable: {}", target, entry.path.display(), e);
                    self.remove_entry(&entry.path)?;
                    continue;
                }
            };

            if let Some(reason) = dependency_mismatch(&metadata, working_dir, hashes) {
                warn!("{} {} to be hit", target, reason);
                continue;
            }

            if metadata.fingerprint != fingerprint {
                self.remove_entry(&entry.path)?;
                error!("{} {} target fingerprint should match to be verified", target, entry.path.display());
                continue;
            }
            let product_hash = sha256_file(&entry.path.join(PRODUCT_FILE_NAME))?;
            if metadata.product_hash != product_hash {
                self.remove_entry(&entry.path)?;
                error!("{} {} product hash should match to be verified", target, entry.path.display());
                continue;
            }

            let no_dependency_targets = metadata.dependency_targets.is_empty();
            candidates.push(Candidate {
                dir: entry.path,
                metadata,
            });
            if no_dependency_targets || candidates.len() >= Self::MAX_CANDIDATES {
                break;
            }
        }

        Ok(candidates)
    }

    /// Commit a built product as a new entry and return its directory.
    pub fn commit(&self, request: CommitRequest<'_>) -> StoreResult<PathBuf> {
        let CommitRequest {
            target,
            kind,
            product_dir,
            wrapper_name,
            mut metadata,
            message,
        } = request;

        kind.validate_product(target, product_dir, wrapper_name)?;
        let plan = kind.archive_plan(target, product_dir, wrapper_name)?;
        let base = product_dir.parent().ok_or_else(|| StoreError::MissingProduct {
            target: target.to_string(),
            path: product_dir.to_path_buf(),
        })?;

        let now = Utc::now();
        let name = EntryName::new(target, &metadata.fingerprint, now.timestamp_millis());
        let entry_dir = self.root.join(name.to_string());
        if entry_dir.exists() {
            self.remove_entry(&entry_dir)?;
            return Err(StoreError::EntryExists(entry_dir));
        }

        rewrite_module_maps(product_dir)?;

        let staging = self
            .root
            .join(STAGING_DIR_NAME)
            .join(format!("{}.{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;

        metadata.product_kind = Some(kind);
        metadata.wrapper_name = wrapper_name.map(str::to_string);
        metadata.created_at = Some(now);

        let staged = write_staged_entry(base, &plan, &staging, &mut metadata, message)
            .and_then(|()| {
                if entry_dir.exists() {
                    return Err(StoreError::EntryExists(entry_dir.clone()));
                }
                fs::rename(&staging, &entry_dir)?;
                Ok(())
            });

        if let Err(e) = staged {
            if staging.exists() {
                self.remove_entry(&staging)?;
            }
            return Err(e);
        }

        debug!("committed {}", entry_dir.display());
        Ok(entry_dir)
    }

    /// Unpack an entry's product next to `product_dir`.
    pub fn extract(&self, entry_dir: &Path, product_dir: &Path) -> StoreResult<()> {
        fs::create_dir_all(product_dir)?;
        let dest = product_dir.parent().unwrap_or(product_dir);
        unpack_archive(&entry_dir.join(PRODUCT_FILE_NAME), dest)
    }

    /// Mark an entry as recently used.
    pub fn touch(&self, entry_dir: &Path) -> StoreResult<()> {
        filetime::set_file_mtime(entry_dir, FileTime::now())?;
        Ok(())
    }

    /// Delete an entry, retrying transient failures.
    ///
    /// An entry that is already gone counts as removed.
    pub fn remove_entry(&self, path: &Path) -> StoreResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt >= REMOVE_ATTEMPTS => {
                    return Err(StoreError::RemoveFailed {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("rm -rf {} failed ({}), retrying", path.display(), e);
                    thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
            }
        }
    }

    /// Remove the whole store.
    pub fn clear(&self) -> StoreResult<()> {
        self.remove_entry(&self.root)
    }
}

fn write_staged_entry(
    base: &Path,
    plan: &ArchivePlan,
    staging: &Path,
    metadata: &mut EntryMetadata,
    message: &str,
) -> StoreResult<()> {
    let archive = staging.join(PRODUCT_FILE_NAME);
    write_archive(base, plan, &archive)?;
    metadata.product_hash = sha256_file(&archive)?;
    metadata.write(staging)?;
    fs::write(staging.join(MESSAGE_FILE_NAME), message)?;
    Ok(())
}

/// Describe the first recorded dependency file that is missing or changed.
fn dependency_mismatch(
    metadata: &EntryMetadata,
    working_dir: &Path,
    hashes: &FileHashCache,
) -> Option<String> {
    for dependency in &metadata.dependency_files {
        let path = working_dir.join(&dependency.path);
        if !path.exists() {
            return Some(format!("{} file should exist", dependency.path));
        }
        match hashes.md5(&path) {
            Ok(md5) if md5 == dependency.md5 => {}
            _ => return Some(format!("{} md5 should match", dependency.path)),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DependencyFileHash, DependencyTarget};
    use crate::hash::md5_hex;
    use tempfile::TempDir;

    const FP: &str = "0cc175b9c0f1b6a831c399e269772661";

    fn make_library(temp_dir: &TempDir) -> PathBuf {
        let product_dir = temp_dir.path().join("build/Debug-iphonesimulator/Foo");
        fs::create_dir_all(&product_dir).unwrap();
        fs::write(product_dir.join("libFoo.a"), b"!<arch>\nfoo").unwrap();
        product_dir
    }

    fn commit_library(store: &CacheStore, product_dir: &Path, metadata: EntryMetadata) -> PathBuf {
        store
            .commit(CommitRequest {
                target: "Foo",
                kind: ProductKind::StaticLibrary,
                product_dir,
                wrapper_name: None,
                metadata,
                message: "Version : test",
            })
            .unwrap()
    }

    #[test]
    fn test_list_entries_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("missing"));
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[test]
    fn test_commit_writes_complete_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);

        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));

        let name = EntryName::parse(&dir.file_name().unwrap().to_string_lossy()).unwrap();
        assert_eq!(name.target, "Foo");
        assert_eq!(name.fingerprint, FP);
        assert!(dir.join(PRODUCT_FILE_NAME).exists());
        assert_eq!(fs::read_to_string(dir.join(MESSAGE_FILE_NAME)).unwrap(), "Version : test");

        let meta = EntryMetadata::read(&dir).unwrap();
        assert_eq!(meta.product_hash, sha256_file(&dir.join(PRODUCT_FILE_NAME)).unwrap());
        assert_eq!(meta.product_kind, Some(ProductKind::StaticLibrary));
        assert!(meta.created_at.is_some());

        // Nothing left behind in staging
        let staging = store.root().join(STAGING_DIR_NAME);
        assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
    }

    #[test]
    fn test_commit_missing_product_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = temp_dir.path().join("build/Foo");
        fs::create_dir_all(&product_dir).unwrap();

        let err = store
            .commit(CommitRequest {
                target: "Foo",
                kind: ProductKind::StaticLibrary,
                product_dir: &product_dir,
                wrapper_name: None,
                metadata: EntryMetadata::new(FP),
                message: "",
            })
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[test]
    fn test_find_candidates_verifies_dependency_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let header = temp_dir.path().join("Vendor.h");
        fs::write(&header, "v1").unwrap();

        let mut meta = EntryMetadata::new(FP);
        meta.dependency_files.push(DependencyFileHash {
            path: "Vendor.h".to_string(),
            md5: md5_hex("v1"),
        });
        let dir = commit_library(&store, &product_dir, meta);

        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert_eq!(found.len(), 1);

        fs::write(&header, "v2").unwrap();
        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert!(found.is_empty());
        assert!(dir.exists(), "environment mismatch must not delete the entry");
    }

    #[test]
    fn test_find_candidates_deletes_corrupt_product() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));

        fs::write(dir.join(PRODUCT_FILE_NAME), b"tampered").unwrap();

        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert!(found.is_empty());
        assert!(!dir.exists(), "corrupt entry must be removed");
    }

    #[test]
    fn test_find_candidates_deletes_fingerprint_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));

        let mut meta = EntryMetadata::read(&dir).unwrap();
        meta.fingerprint = "ffffffffffffffffffffffffffffffff".to_string();
        meta.write(&dir).unwrap();

        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert!(found.is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn test_find_candidates_stops_at_entry_without_dependency_targets() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);

        let old = commit_library(&store, &product_dir, EntryMetadata::new(FP));
        filetime::set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();

        let mut meta = EntryMetadata::new(FP);
        meta.dependency_targets.push(DependencyTarget {
            name: "Base".to_string(),
            fingerprint: FP.to_string(),
        });
        thread::sleep(Duration::from_millis(5));
        let newer = commit_library(&store, &product_dir, meta);

        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].dir, newer);
        assert_eq!(found[1].dir, old);
    }

    #[test]
    fn test_find_candidates_ignores_incomplete_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let partial = store.root().join(format!("Foo-{}-1", FP));
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join(PRODUCT_FILE_NAME), b"x").unwrap();

        let found = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert!(found.is_empty());
        assert!(partial.exists());
    }

    #[test]
    fn test_extract_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));

        let other_root = temp_dir.path().join("other/Debug-iphonesimulator/Foo");
        store.extract(&dir, &other_root).unwrap();
        assert_eq!(fs::read(other_root.join("libFoo.a")).unwrap(), b"!<arch>\nfoo");
    }

    #[test]
    fn test_touch_updates_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));
        filetime::set_file_mtime(&dir, FileTime::from_unix_time(1_000, 0)).unwrap();

        store.touch(&dir).unwrap();
        let modified = fs::metadata(&dir).unwrap().modified().unwrap();
        assert!(modified > SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
    }

    #[test]
    fn test_remove_missing_entry_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        assert!(store.remove_entry(&temp_dir.path().join("gone")).is_ok());
    }

    #[test]
    fn test_find_candidates_matches_whole_entry_name() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("cache"));
        let product_dir = make_library(&temp_dir);
        let dir = commit_library(&store, &product_dir, EntryMetadata::new(FP));

        // Same target and fingerprint prefix, but not a committed entry name
        let stray = store.root().join(format!("Foo-{}-copy", FP));
        fs::create_dir_all(&stray).unwrap();
        for file in [PRODUCT_FILE_NAME, METADATA_FILE_NAME] {
            fs::copy(dir.join(file), stray.join(file)).unwrap();
        }

        let candidates = store
            .find_candidates("Foo", FP, temp_dir.path(), &FileHashCache::new())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].dir, dir);
        assert!(stray.exists());
    }
}

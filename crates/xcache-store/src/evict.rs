//! Cache eviction.
//!
//! Entries are ranked by directory mtime, which a cache hit refreshes. The
//! newest `keep_count` entries survive; everything older is removed.
//!
//! A commit that was killed mid-write leaves its directory under
//! `.staging/`. Those are reclaimed once they are older than
//! `staging_max_age_secs`; younger ones may belong to a commit in progress.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::store::{CacheStore, STAGING_DIR_NAME};

/// Default number of entries kept after eviction.
pub const DEFAULT_KEEP_COUNT: usize = 10000;

/// Age after which an abandoned staging directory is reclaimed.
pub const DEFAULT_STAGING_MAX_AGE_SECS: u64 = 60 * 60;

/// Eviction policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Number of most recently used entries to keep
    pub keep_count: usize,
    /// Staging directories older than this are abandoned commits
    #[serde(default = "default_staging_max_age_secs")]
    pub staging_max_age_secs: u64,
    /// Whether to dry-run (log but don't delete)
    #[serde(default)]
    pub dry_run: bool,
}

fn default_staging_max_age_secs() -> u64 {
    DEFAULT_STAGING_MAX_AGE_SECS
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::keep_last(DEFAULT_KEEP_COUNT)
    }
}

impl EvictionPolicy {
    /// Keep the `keep_count` most recently used entries.
    pub fn keep_last(keep_count: usize) -> Self {
        Self {
            keep_count,
            staging_max_age_secs: DEFAULT_STAGING_MAX_AGE_SECS,
            dry_run: false,
        }
    }

    /// Override the staging reclaim age.
    pub fn with_staging_max_age(mut self, max_age: Duration) -> Self {
        self.staging_max_age_secs = max_age.as_secs();
        self
    }

    /// Set dry-run mode.
    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of an eviction run.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    /// Entries found before eviction
    pub scanned: usize,
    /// Total size of scanned entries in bytes
    pub total_size_bytes: u64,
    /// Oldest entry by mtime
    pub oldest: Option<DateTime<Utc>>,
    /// Newest entry by mtime
    pub newest: Option<DateTime<Utc>>,
    /// Removed (or, in dry-run, would-be-removed) entries
    pub removed: Vec<PathBuf>,
    /// Reclaimed (or would-be-reclaimed) abandoned staging directories
    pub staging_removed: Vec<PathBuf>,
    /// Total size of reclaimed staging directories in bytes
    pub staging_size_bytes: u64,
}

impl CacheStore {
    /// Remove every entry beyond the newest `policy.keep_count`.
    pub fn evict(&self, policy: &EvictionPolicy) -> StoreResult<EvictionReport> {
        let entries = self.list_entries()?;

        let mut report = EvictionReport {
            scanned: entries.len(),
            newest: entries.first().map(|e| to_utc(e.modified)),
            oldest: entries.last().map(|e| to_utc(e.modified)),
            ..Default::default()
        };
        for entry in &entries {
            // Concurrent eviction may remove entries under us
            report.total_size_bytes += dir_size(&entry.path).unwrap_or(0);
        }

        info!(
            "cache count {} size {} bytes oldest {} newest {}",
            report.scanned,
            report.total_size_bytes,
            report.oldest.map(|t| t.to_rfc3339()).unwrap_or_default(),
            report.newest.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );

        for entry in entries.into_iter().skip(policy.keep_count) {
            if policy.dry_run {
                info!("DRY-RUN: would remove {}", entry.path.display());
            } else {
                self.remove_entry(&entry.path)?;
                debug!("removed {}", entry.path.display());
            }
            report.removed.push(entry.path);
        }

        self.reclaim_staging(policy, &mut report)?;
        Ok(report)
    }

    /// Remove staging directories older than the policy allows.
    fn reclaim_staging(&self, policy: &EvictionPolicy, report: &mut EvictionReport) -> StoreResult<()> {
        let staging_root = self.root().join(STAGING_DIR_NAME);
        let dirs = match fs::read_dir(&staging_root) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let max_age = Duration::from_secs(policy.staging_max_age_secs);
        let now = SystemTime::now();
        for dir in dirs {
            let dir = dir?;
            let metadata = match dir.metadata() {
                Ok(metadata) if metadata.is_dir() => metadata,
                Ok(_) => continue,
                // The commit finished and renamed it away
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified = metadata.modified()?;
            let stale = now.duration_since(modified).map_or(false, |age| age > max_age);
            if !stale {
                continue;
            }

            let path = dir.path();
            report.staging_size_bytes += dir_size(&path).unwrap_or(0);
            if policy.dry_run {
                info!("DRY-RUN: would reclaim {}", path.display());
            } else {
                self.remove_entry(&path)?;
                info!("reclaimed abandoned commit {}", path.display());
            }
            report.staging_removed.push(path);
        }
        Ok(())
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Calculate directory size recursively.
pub(crate) fn dir_size(path: &Path) -> StoreResult<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                size += dir_size(&path)?;
            } else {
                size += meta.len();
            }
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn create_entry(root: &Path, name: &str, mtime_secs: i64) -> PathBuf {
        let path = root.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("product.tar"), vec![0u8; 100]).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        path
    }

    #[test]
    fn test_eviction_policy_default() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.keep_count, 10000);
        assert_eq!(policy.staging_max_age_secs, 3600);
        assert!(!policy.dry_run);
    }

    #[test]
    fn test_evict_keeps_most_recent() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        let a = create_entry(temp_dir.path(), "A-00-1", 1_000);
        let b = create_entry(temp_dir.path(), "B-00-2", 3_000);
        let c = create_entry(temp_dir.path(), "C-00-3", 2_000);

        let report = store.evict(&EvictionPolicy::keep_last(2)).unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.total_size_bytes, 300);
        assert_eq!(report.removed, vec![a.clone()]);
        assert!(!a.exists());
        assert!(b.exists());
        assert!(c.exists());
        assert_eq!(report.oldest.unwrap().timestamp(), 1_000);
        assert_eq!(report.newest.unwrap().timestamp(), 3_000);
    }

    #[test]
    fn test_evict_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        let a = create_entry(temp_dir.path(), "A-00-1", 1_000);
        create_entry(temp_dir.path(), "B-00-2", 2_000);

        let report = store
            .evict(&EvictionPolicy::keep_last(1).with_dry_run())
            .unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(a.exists());
    }

    #[test]
    fn test_evict_reclaims_stale_staging_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        let stale = create_entry(&temp_dir.path().join(".staging"), "A-00-1.deadbeef", 1_000);
        let fresh = temp_dir.path().join(".staging/B-00-2.cafebabe");
        fs::create_dir_all(&fresh).unwrap();
        fs::write(fresh.join("product.tar"), vec![0u8; 10]).unwrap();
        create_entry(temp_dir.path(), "A-00-1", 1_000);

        let report = store.evict(&EvictionPolicy::keep_last(1)).unwrap();

        // Staging dirs are never counted as entries
        assert_eq!(report.scanned, 1);
        assert!(report.removed.is_empty());
        assert_eq!(report.staging_removed, vec![stale.clone()]);
        assert_eq!(report.staging_size_bytes, 100);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_staging_dry_run_keeps_stale_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        let stale = create_entry(&temp_dir.path().join(".staging"), "A-00-1.deadbeef", 1_000);

        let report = store
            .evict(&EvictionPolicy::keep_last(0).with_dry_run())
            .unwrap();
        assert_eq!(report.staging_removed.len(), 1);
        assert!(stale.exists());
    }

    #[test]
    fn test_staging_max_age_is_configurable() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path());
        let fresh = temp_dir.path().join(".staging/A-00-1.deadbeef");
        fs::create_dir_all(&fresh).unwrap();
        let two_minutes_ago = SystemTime::now() - Duration::from_secs(120);
        filetime::set_file_mtime(&fresh, FileTime::from_system_time(two_minutes_ago)).unwrap();

        let kept = store.evict(&EvictionPolicy::keep_last(0)).unwrap();
        assert!(kept.staging_removed.is_empty());

        let policy = EvictionPolicy::keep_last(0).with_staging_max_age(Duration::from_secs(60));
        let reclaimed = store.evict(&policy).unwrap();
        assert_eq!(reclaimed.staging_removed, vec![fresh.clone()]);
        assert!(!fresh.exists());
    }

    #[test]
    fn test_evict_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(temp_dir.path().join("missing"));
        let report = store.evict(&EvictionPolicy::keep_last(0)).unwrap();
        assert_eq!(report.scanned, 0);
        assert!(report.oldest.is_none());
    }
}

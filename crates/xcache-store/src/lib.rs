//! Content-addressed on-disk store for cached target products.
//!
//! Each entry is a directory named `<target>-<fingerprint>-<created_millis>`
//! holding the archived product, its metadata and the fingerprint content
//! it was created from. Entries are immutable once committed; eviction and
//! corruption handling remove them whole.
//!
//! The store never decides whether an entry is usable for a build. It only
//! verifies that an entry is intact and that the external files it recorded
//! are unchanged; choosing between candidates is up to the caller.

pub mod archive;
pub mod entry;
pub mod error;
pub mod evict;
pub mod hash;
pub mod store;

pub use archive::{rewrite_module_maps, unpack_archive, write_archive, ArchivePlan};
pub use entry::{
    BuildDirAliases, DependencyFileHash, DependencyTarget, EntryMetadata, EntryName, ProductKind,
    MESSAGE_FILE_NAME, METADATA_FILE_NAME, PRODUCT_FILE_NAME, SCHEMA_ID, SCHEMA_VERSION,
};
pub use error::{StoreError, StoreResult};
pub use evict::{EvictionPolicy, EvictionReport, DEFAULT_KEEP_COUNT, DEFAULT_STAGING_MAX_AGE_SECS};
pub use hash::{md5_file, md5_hex, sha256_file, FileHashCache};
pub use store::{
    CacheStore, Candidate, CommitRequest, StoredEntry, REMOVE_ATTEMPTS, STAGING_DIR_NAME,
};

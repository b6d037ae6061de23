//! Store error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from cache store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{target} {path} should exist")]
    MissingProduct { target: String, path: PathBuf },

    #[error("{target} WRAPPER_NAME should be found")]
    MissingWrapperName { target: String },

    #[error("{0} should not exist")]
    EntryExists(PathBuf),

    #[error("invalid cache entry name: {0}")]
    InvalidEntryName(String),

    #[error("failed to remove {path} after {attempts} attempts: {source}")]
    RemoveFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Whether the error leaves the store in a state that cannot be trusted.
    ///
    /// Non-fatal errors only affect the target being committed; fatal errors
    /// come from filesystem mutations that failed half way.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::MissingProduct { .. }
            | Self::MissingWrapperName { .. }
            | Self::EntryExists(_)
            | Self::InvalidEntryName(_) => false,
            Self::Io(_) | Self::Json(_) | Self::Walk(_) | Self::RemoveFailed { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let missing = StoreError::MissingProduct {
            target: "Foo".to_string(),
            path: PathBuf::from("/build/Foo/libFoo.a"),
        };
        assert!(!missing.is_fatal());
        assert_eq!(missing.to_string(), "Foo /build/Foo/libFoo.a should exist");

        let io = StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(io.is_fatal());
    }
}

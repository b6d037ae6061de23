//! xcodebuild argv parser.
//!
//! Finds the build configuration of an xcodebuild invocation and derives the
//! argument list that participates in target fingerprints.

use thiserror::Error;

/// The one flag every cached build must carry.
pub const CONFIGURATION_FLAG: &str = "-configuration";

/// Flags whose value is a machine-local output location.
///
/// The flag and the argument that follows it never reach a fingerprint.
pub const TEMP_PATH_FLAGS: &[&str] = &[
    "-derivedDataPath",
    "-archivePath",
    "-exportPath",
    "-packageCachePath",
];

/// Build-setting assignments that relocate build roots.
pub const TEMP_PATH_SETTINGS: &[&str] = &["DSTROOT=", "OBJROOT=", "SYMROOT="];

/// Errors from argv parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgvError {
    #[error("flag {0} requires a value")]
    MissingValue(String),

    #[error("{0} should be set")]
    MissingFlag(&'static str),
}

/// The build configuration named by `-configuration <name>`.
///
/// Only the first occurrence counts. No other flag is interpreted, so a
/// trailing `-workspace` or an unknown flag is left to xcodebuild.
pub fn configuration(argv: &[String]) -> Result<&str, ArgvError> {
    let index = argv
        .iter()
        .position(|arg| arg == CONFIGURATION_FLAG)
        .ok_or(ArgvError::MissingFlag(CONFIGURATION_FLAG))?;
    argv.get(index + 1)
        .map(String::as_str)
        .ok_or_else(|| ArgvError::MissingValue(CONFIGURATION_FLAG.to_string()))
}

/// Arguments that participate in a target fingerprint.
///
/// Drops every [`TEMP_PATH_FLAGS`] flag together with the word after it and
/// every [`TEMP_PATH_SETTINGS`] assignment. Everything else is kept verbatim
/// and in order.
pub fn filter_cache_key_args(argv: &[String]) -> Vec<String> {
    argv.iter()
        .enumerate()
        .filter(|(index, arg)| {
            if TEMP_PATH_FLAGS.contains(&arg.as_str()) {
                return false;
            }
            if *index > 0 && TEMP_PATH_FLAGS.contains(&argv[index - 1].as_str()) {
                return false;
            }
            !TEMP_PATH_SETTINGS.iter().any(|prefix| arg.starts_with(prefix))
        })
        .map(|(_, arg)| arg.clone())
        .collect()
}

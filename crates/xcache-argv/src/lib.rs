//! xcodebuild argument handling for the target cache.
//!
//! Finds the build configuration of the wrapped xcodebuild invocation and
//! derives the subset of arguments that are allowed to influence a target
//! fingerprint.

mod parser;

pub use parser::{
    configuration, filter_cache_key_args, ArgvError, CONFIGURATION_FLAG, TEMP_PATH_FLAGS,
    TEMP_PATH_SETTINGS,
};

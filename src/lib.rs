//! xcache - per-target build output cache for Xcode projects
//!
//! Wraps an `xcodebuild` invocation in a `pre` and a `post` stage. `pre`
//! fingerprints every cacheable target, decides which targets can reuse a
//! stored product and plans the build graph edits; `post` archives the
//! products of targets that had to be built. Products live in a local
//! directory store shared between checkouts.

pub mod checksums;
pub mod config;
pub mod context;
pub mod depfile;
pub mod fingerprint;
pub mod implicit;
pub mod pipeline;
pub mod plan;
pub mod project;
pub mod resolver;

pub use checksums::SpecChecksums;
pub use config::{CacheSettings, ConfigError, EffectiveConfig};
pub use context::{BuildSettings, ContextStore, TargetContext, TargetId, TargetStatus};
pub use fingerprint::{Fingerprint, FingerprintComputer, FingerprintError, PathStripper};
pub use pipeline::{Pipeline, PipelineError, PipelineResult, PostSummary};
pub use plan::{BuildGraphEditor, BuildPlan, ExtractStep, PlanEditor, PrintenvStep};
pub use project::{ManifestProjectModel, Project, ProjectModel, Target};
pub use resolver::ResolutionSummary;

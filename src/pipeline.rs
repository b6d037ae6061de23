//! Stage orchestration.
//!
//! A cached build runs in stages around the real build:
//! - `pre`: fingerprint cacheable targets, resolve hits, plan graph edits
//! - `printenv`: (during the build) record a missed target's build settings
//! - `extract`: (during the build) unpack a hit target's product
//! - `post`: commit every missed target that built cleanly, then evict
//!
//! `keep` evicts without building and `clean` drops per-build state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info};
use xcache_argv::ArgvError;
use xcache_store::{
    CacheStore, CommitRequest, EntryMetadata, EvictionPolicy, EvictionReport, FileHashCache,
    ProductKind, StoreError,
};

use crate::checksums::SpecChecksums;
use crate::config::{CacheSettings, ConfigError};
use crate::context::{
    ContextError, ContextStore, TargetContext, TargetId, TargetStatus, BUILD_KEY_SYMROOT,
    BUILD_KEY_TARGET_BUILD_DIR, BUILD_KEY_TARGET_TEMP_DIR,
};
use crate::depfile::{external_dependencies, extract_dependencies, DependencyError, OwnBuildDirs};
use crate::fingerprint::{Fingerprint, FingerprintComputer, FingerprintError, PathStripper};
use crate::implicit;
use crate::plan::{BuildGraphEditor, ExtractStep, PrintenvStep, BUILD_PLAN_FILE_NAME};
use crate::project::{
    resolve_path, ManifestProjectModel, Project, ProjectError, ProjectModel, Target,
};
use crate::resolver::{discover_candidates, resolve, ResolutionSummary};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("project error: {0}")]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Argv(#[from] ArgvError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("state error: {0}")]
    Context(#[from] ContextError),

    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} should be set")]
    MissingEnv(&'static str),

    #[error("{0} should have a context")]
    MissingContext(String),
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) | PipelineError::Argv(_) | PipelineError::MissingEnv(_) => 2,
            _ => 1,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a target was left out of a `post` pass.
///
/// These never abort the pass.
#[derive(Debug, Error)]
pub enum TargetCheckError {
    #[error("{target} {key} should be set")]
    MissingSetting { target: String, key: &'static str },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("{target} {source}")]
    Fingerprint {
        target: String,
        #[source]
        source: FingerprintError,
    },

    #[error("{target} md5 should not be changed after build")]
    FingerprintChanged { target: String },

    #[error("{target} {file} should be supported")]
    UnsupportedModuleMap { target: String, file: String },

    #[error("{target} should be hit or miss")]
    Unresolved { target: String },
}

/// Outcome of a `post` pass.
#[derive(Debug, Clone, Default)]
pub struct PostSummary {
    /// Entries committed
    pub added: usize,
    /// Targets left out because of a per-target error
    pub excluded: usize,
    pub eviction: EvictionReport,
}

/// A target taking part in caching this pass.
struct Cacheable<'m> {
    project: &'m Project,
    target: &'m Target,
    kind: ProductKind,
    source_files: Vec<PathBuf>,
}

impl Cacheable<'_> {
    fn id(&self) -> TargetId {
        TargetId::new(self.project.id(), &self.target.name)
    }
}

/// A target that survived the `post` checks.
struct PostTarget {
    context: TargetContext,
    /// Recomputed after the build; None for hits
    fingerprint: Option<Fingerprint>,
}

/// Runs `pre` and `post` over one project model.
pub struct Pipeline<M> {
    settings: CacheSettings,
    model: M,
    checksums: SpecChecksums,
    working_dir: PathBuf,
    store: CacheStore,
    contexts: ContextStore,
}

impl Pipeline<ManifestProjectModel> {
    /// Load the project manifest and lockfile named by `settings`.
    pub fn open(settings: CacheSettings, working_dir: &Path) -> PipelineResult<Self> {
        let manifest = resolve_path(working_dir, &settings.project.manifest);
        let model = ManifestProjectModel::load(&manifest)?;
        let checksums = SpecChecksums::load(&resolve_path(working_dir, &settings.project.lockfile))?;
        Ok(Self::new(settings, model, checksums, working_dir))
    }
}

impl<M: ProjectModel> Pipeline<M> {
    pub fn new(
        settings: CacheSettings,
        model: M,
        checksums: SpecChecksums,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = working_dir.into();
        let store = CacheStore::new(settings.cache.root.clone());
        let contexts = ContextStore::new(resolve_path(&working_dir, &settings.state_dir));
        Self {
            settings,
            model,
            checksums,
            working_dir,
            store,
            contexts,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// Where `pre` callers should write the build plan.
    pub fn plan_path(&self) -> PathBuf {
        self.contexts.state_dir().join(BUILD_PLAN_FILE_NAME)
    }

    fn cacheable_targets(&self) -> Vec<Cacheable<'_>> {
        let mut found = Vec::new();
        for project in self.model.projects() {
            for target in &project.targets {
                if !target.is_cacheable() {
                    continue;
                }
                let Some(kind) = target.product_kind() else {
                    continue;
                };
                let source_files = target.collect_source_files();
                if source_files.len() < self.settings.targets.min_source_file_count {
                    debug!("{} has {} source files, skipped", target.name, source_files.len());
                    continue;
                }
                found.push(Cacheable {
                    project,
                    target,
                    kind,
                    source_files,
                });
            }
        }
        found
    }

    /// Fingerprint, resolve and plan.
    ///
    /// Every target ends up Hit or Miss and is persisted for the later
    /// stages. A target that cannot be fingerprinted is left out and builds
    /// normally.
    pub fn pre<E>(&self, argv: &[String], editor: &mut E) -> PipelineResult<ResolutionSummary>
    where
        E: BuildGraphEditor + ?Sized,
    {
        let configuration = xcache_argv::configuration(argv)?;
        let start = Instant::now();

        if self.settings.cache.clear_all {
            info!("clear all {}", self.store.root().display());
            self.store.clear()?;
        }
        self.contexts.clear()?;
        fs::create_dir_all(self.contexts.state_dir())?;

        let stripper = PathStripper::new(&self.working_dir)?;
        let hashes = FileHashCache::new();
        let computer = FingerprintComputer::new(&stripper, &self.checksums, &hashes);

        let mut contexts = Vec::new();
        for cacheable in self.cacheable_targets() {
            let computed = computer.compute(
                cacheable.project,
                cacheable.target,
                configuration,
                argv,
                &cacheable.source_files,
            );
            match computed {
                Ok(fingerprint) => {
                    contexts.push(TargetContext::new(cacheable.id(), cacheable.kind, fingerprint.hash))
                }
                Err(e) => error!("{} {}", cacheable.target.name, e),
            }
        }

        let candidates = discover_candidates(&mut contexts, &self.store, &self.working_dir, &hashes)?;
        let summary = resolve(&mut contexts, &candidates);

        for context in &contexts {
            match (context.status, context.chosen_cache_dir.as_ref()) {
                (TargetStatus::Hit, Some(entry_dir)) => {
                    self.store.touch(entry_dir)?;
                    editor.disable_build_and_inject_extract(
                        &context.id.project,
                        context.name(),
                        ExtractStep {
                            entry_dir: entry_dir.clone(),
                            product_alias: context.aliases.target_build_dir_name.clone().unwrap_or_default(),
                            temp_alias: context.aliases.target_temp_dir_name.clone().unwrap_or_default(),
                        },
                    );
                }
                _ => editor.inject_printenv(
                    &context.id.project,
                    context.name(),
                    PrintenvStep {
                        target: context.name().to_string(),
                        project: context.id.project.clone(),
                        state_dir: self.contexts.state_dir().to_path_buf(),
                    },
                ),
            }
            self.contexts.save(context)?;
        }

        info!("{}", summary);
        info!("duration = {} s in stage pre", start.elapsed().as_secs());
        Ok(summary)
    }

    /// Commit every missed target that built cleanly, then evict.
    pub fn post(&self, argv: &[String]) -> PipelineResult<PostSummary> {
        let configuration = xcache_argv::configuration(argv)?;
        let start = Instant::now();

        let stripper = PathStripper::new(&self.working_dir)?;
        let hashes = FileHashCache::new();
        let computer = FingerprintComputer::new(&stripper, &self.checksums, &hashes);

        let mut summary = PostSummary::default();
        let mut targets = Vec::new();
        for cacheable in self.cacheable_targets() {
            let Some(mut context) = self.contexts.load(&cacheable.id())? else {
                continue;
            };
            let checked = match context.status {
                TargetStatus::Miss => self
                    .check_miss(&cacheable, configuration, argv, &computer, &stripper, &mut context)
                    .map(Some),
                TargetStatus::Hit => self.check_hit(&context).map(|()| None),
                TargetStatus::Unresolved => Err(TargetCheckError::Unresolved {
                    target: context.name().to_string(),
                }),
            };
            match checked {
                Ok(fingerprint) => targets.push(PostTarget {
                    context,
                    fingerprint,
                }),
                Err(e) => {
                    error!("{}", e);
                    summary.excluded += 1;
                }
            }
        }

        let all: Vec<TargetContext> = targets.iter().map(|t| t.context.clone()).collect();
        for PostTarget {
            context,
            fingerprint,
        } in &mut targets
        {
            let Some(fingerprint) = fingerprint.as_ref() else {
                continue;
            };
            if self.commit(context, fingerprint, &all, &stripper, &hashes)? {
                summary.added += 1;
            }
        }

        summary.eviction = self
            .store
            .evict(&EvictionPolicy::keep_last(self.settings.cache.count))?;

        info!("total add {}", summary.added);
        info!("duration = {} s in stage post", start.elapsed().as_secs());
        Ok(summary)
    }

    /// Collect the dependencies of a missed target and confirm the build did
    /// not change its inputs.
    fn check_miss(
        &self,
        cacheable: &Cacheable<'_>,
        configuration: &str,
        argv: &[String],
        computer: &FingerprintComputer<'_>,
        stripper: &PathStripper,
        context: &mut TargetContext,
    ) -> Result<Fingerprint, TargetCheckError> {
        let name = context.name().to_string();
        let settings = context.build_settings.clone();
        let missing = |key| TargetCheckError::MissingSetting {
            target: name.clone(),
            key,
        };
        let product_dir = settings
            .target_build_dir
            .as_deref()
            .ok_or_else(|| missing(BUILD_KEY_TARGET_BUILD_DIR))?;
        let intermediate_dir = settings
            .target_temp_dir
            .as_deref()
            .ok_or_else(|| missing(BUILD_KEY_TARGET_TEMP_DIR))?;

        let dirs = OwnBuildDirs {
            intermediate_dir,
            product_dir,
            xcframeworks_dir: settings.pods_xcframeworks_build_dir.as_deref(),
        };
        let dependencies = extract_dependencies(&name, dirs)?;
        context.dependency_files =
            external_dependencies(&name, context.product_kind, &cacheable.source_files, dependencies)?;

        let fingerprint = computer
            .compute(
                cacheable.project,
                cacheable.target,
                configuration,
                argv,
                &cacheable.source_files,
            )
            .map_err(|source| TargetCheckError::Fingerprint {
                target: name.clone(),
                source,
            })?;
        if fingerprint.hash != context.fingerprint {
            return Err(TargetCheckError::FingerprintChanged { target: name });
        }

        let module_map = settings.modulemap_file.as_deref().filter(|m| !m.is_empty());
        if let (Some(srcroot), Some(module_map)) = (settings.srcroot.as_deref(), module_map) {
            let portable = stripper.strip_path(&srcroot.join(module_map));
            if Path::new(&portable).is_relative() && self.working_dir.join(&portable).exists() {
                context.module_map_file = Some(portable);
            } else {
                return Err(TargetCheckError::UnsupportedModuleMap {
                    target: name,
                    file: module_map.to_string(),
                });
            }
        }

        context.aliases = settings.aliases();
        Ok(fingerprint)
    }

    /// A hit's module map is referenced by path from dependents; it has to
    /// exist in this checkout.
    fn check_hit(&self, context: &TargetContext) -> Result<(), TargetCheckError> {
        match context.module_map_file.as_deref().filter(|m| !m.is_empty()) {
            Some(module_map) if !self.working_dir.join(module_map).exists() => {
                Err(TargetCheckError::UnsupportedModuleMap {
                    target: context.name().to_string(),
                    file: module_map.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Commit one missed target. Returns whether an entry was added; only a
    /// fatal store error is propagated.
    ///
    /// The dependency sets recorded in the entry are also persisted in the
    /// target's context.
    fn commit(
        &self,
        context: &mut TargetContext,
        fingerprint: &Fingerprint,
        all: &[TargetContext],
        stripper: &PathStripper,
        hashes: &FileHashCache,
    ) -> PipelineResult<bool> {
        let implicit = implicit::detect(
            context,
            all,
            &self.working_dir,
            self.settings.targets.detect_module_map_dependency,
        );
        let dependency_files = match implicit::hash_dependency_files(&implicit.files, stripper, hashes) {
            Ok(files) => files,
            Err(e) => {
                error!("{} dependency files should be readable: {}", context.name(), e);
                return Ok(false);
            }
        };
        context.dependency_file_hashes = dependency_files;
        context.dependency_targets = implicit.targets;
        self.contexts.save(context)?;

        let Some(product_dir) = context.build_settings.target_build_dir.as_deref() else {
            return Ok(false);
        };

        let mut metadata = EntryMetadata::new(&context.fingerprint);
        metadata.dependency_files = context.dependency_file_hashes.clone();
        metadata.dependency_targets = context.dependency_targets.clone();
        metadata.aliases = context.aliases.clone();
        metadata.module_map_file = context.module_map_file.clone();

        let request = CommitRequest {
            target: context.name(),
            kind: context.product_kind,
            product_dir,
            wrapper_name: context.build_settings.wrapper_name.as_deref(),
            metadata,
            message: &fingerprint.content,
        };
        match self.store.commit(request) {
            Ok(entry_dir) => {
                info!("add {} {}", context.name(), entry_dir.display());
                Ok(true)
            }
            Err(e) if !e.is_fatal() => {
                error!("{}", e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Record the build settings of a missed target from its build environment.
pub fn printenv<F>(contexts: &ContextStore, id: &TargetId, lookup: F) -> PipelineResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut context = contexts
        .load(id)?
        .ok_or_else(|| PipelineError::MissingContext(id.target.clone()))?;
    context.build_settings.capture(lookup);
    contexts.save(&context)?;
    Ok(())
}

/// Unpack an entry into `$SYMROOT/<product_alias>`. Returns the product dir.
///
/// The intermediate alias is accepted for symmetry with the build step but
/// nothing is restored there.
pub fn extract<F>(
    store: &CacheStore,
    entry_dir: &Path,
    product_alias: &str,
    lookup: F,
) -> PipelineResult<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let symroot = lookup(BUILD_KEY_SYMROOT)
        .filter(|v| !v.is_empty())
        .ok_or(PipelineError::MissingEnv(BUILD_KEY_SYMROOT))?;
    let product_dir = Path::new(&symroot).join(product_alias);
    info!("extract {} to {}", entry_dir.display(), product_dir.display());
    store.extract(entry_dir, &product_dir)?;
    Ok(product_dir)
}

/// Evict without building.
pub fn keep(store: &CacheStore, policy: &EvictionPolicy) -> PipelineResult<EvictionReport> {
    let start = Instant::now();
    let report = store.evict(policy)?;
    info!("duration = {} s in stage keep", start.elapsed().as_secs());
    Ok(report)
}

/// Drop all per-build state.
pub fn clean(contexts: &ContextStore) -> PipelineResult<()> {
    contexts.clear()?;
    Ok(())
}

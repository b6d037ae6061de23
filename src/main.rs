//! xcache CLI
//!
//! Entry point for the `xcache` command-line tool.

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xcache::config::DEFAULT_CONFIG_FILE;
use xcache::pipeline::{self, PipelineError, PipelineResult};
use xcache::{CacheSettings, ContextStore, EffectiveConfig, Pipeline, PlanEditor, TargetId};
use xcache_store::{CacheStore, EvictionPolicy};

/// File name of the effective configuration written by `pre`.
const EFFECTIVE_CONFIG_FILE_NAME: &str = "effective_config.json";

#[derive(Parser)]
#[command(name = "xcache")]
#[command(about = "Per-target build output cache for Xcode projects", version)]
struct Cli {
    /// Path to config file (default: .xcache.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Path to the project manifest
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Directory for per-build state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Cache store root
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve hits and plan the build (before xcodebuild)
    Pre {
        /// The xcodebuild arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Commit built targets and evict (after xcodebuild)
    Post {
        /// The xcodebuild arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Unpack a cached product (build step of a hit target)
    Extract {
        cache_dir: PathBuf,
        /// Product directory relative to SYMROOT
        product_path: String,
        /// Intermediate directory relative to OBJROOT
        intermediate_path: String,
    },

    /// Record build settings (build step of a missed target)
    Printenv { target: String, project: String },

    /// Evict old entries
    Keep {
        /// Report what would be removed without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove per-build state
    Clean,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> PipelineResult<()> {
    let working_dir = env::current_dir()?;
    let config = load_config(&cli, &working_dir)?;
    let settings = config.settings()?;

    match cli.command {
        Commands::Pre { args } => run_pre(settings, &config, &working_dir, &args),
        Commands::Post { args } => {
            let pipeline = Pipeline::open(settings, &working_dir)?;
            let summary = pipeline.post(&args)?;
            if summary.excluded > 0 {
                info!("{} targets not cached", summary.excluded);
            }
            Ok(())
        }
        Commands::Extract {
            cache_dir,
            product_path,
            intermediate_path: _,
        } => {
            let store = CacheStore::new(settings.cache.root);
            pipeline::extract(&store, &cache_dir, &product_path, |key| env::var(key).ok())?;
            Ok(())
        }
        Commands::Printenv { target, project } => {
            let contexts = context_store(&settings, &working_dir);
            pipeline::printenv(&contexts, &TargetId::new(project, target), |key| env::var(key).ok())
        }
        Commands::Keep { dry_run } => {
            let store = CacheStore::new(settings.cache.root);
            let mut policy = EvictionPolicy::keep_last(settings.cache.count);
            if dry_run {
                policy = policy.with_dry_run();
            }
            let report = pipeline::keep(&store, &policy)?;
            let verb = if dry_run { "would remove" } else { "removed" };
            info!(
                "{} {} of {} entries and {} abandoned commits",
                verb,
                report.removed.len(),
                report.scanned,
                report.staging_removed.len()
            );
            Ok(())
        }
        Commands::Clean => pipeline::clean(&context_store(&settings, &working_dir)),
    }
}

fn run_pre(
    settings: CacheSettings,
    config: &EffectiveConfig,
    working_dir: &Path,
    args: &[String],
) -> PipelineResult<()> {
    let mut editor = PlanEditor::new(settings.extract_once);
    let pipeline = Pipeline::open(settings, working_dir)?;
    pipeline.pre(args, &mut editor)?;

    let plan_path = pipeline.plan_path();
    editor.finish().save(&plan_path)?;
    config.write_to_file(&pipeline.contexts().state_dir().join(EFFECTIVE_CONFIG_FILE_NAME))?;
    info!("build plan written to {}", plan_path.display());
    Ok(())
}

fn context_store(settings: &CacheSettings, working_dir: &Path) -> ContextStore {
    if settings.state_dir.is_absolute() {
        ContextStore::new(settings.state_dir.clone())
    } else {
        ContextStore::new(working_dir.join(&settings.state_dir))
    }
}

fn load_config(cli: &Cli, working_dir: &Path) -> Result<EffectiveConfig, PipelineError> {
    let file = cli
        .config
        .clone()
        .unwrap_or_else(|| working_dir.join(DEFAULT_CONFIG_FILE));
    let env_layer = EffectiveConfig::env_layer(|key| env::var(key).ok());
    Ok(EffectiveConfig::build(Some(&file), env_layer, cli_layer(cli))?)
}

/// CLI flags as a config layer.
fn cli_layer(cli: &Cli) -> Option<Value> {
    let mut layer = Map::new();
    if let Some(root) = &cli.cache_root {
        layer.insert("cache".to_string(), json!({ "root": root }));
    }
    if let Some(manifest) = &cli.manifest {
        layer.insert("project".to_string(), json!({ "manifest": manifest }));
    }
    if let Some(state_dir) = &cli.state_dir {
        layer.insert("state_dir".to_string(), json!(state_dir));
    }
    (!layer.is_empty()).then(|| Value::Object(layer))
}

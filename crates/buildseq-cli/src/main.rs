//! buildseq - dependency-ordered, phase-sequenced package builds
//!
//! ## Commands
//!
//! - `run`: build every package of a manifest, resuming from the checkpoint
//! - `resume`: continue the run recorded in the state directory
//! - `status`: report checkpointed progress without running anything
//! - `plan`: print the build plan of a manifest
//! - `compact`: rewrite the checkpoint log keeping only the latest records
//! - `reset`: delete the checkpoint and run metadata
//!
//! Exit status is 0 when every package succeeded, 1 when any package did not,
//! and 2 when the run itself failed (bad manifest, cycle, checkpoint error).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use buildseq_core::{
    init_tracing, BuildPlan, DependencyGraph, LogFormat, Manifest, Orchestrator,
    OrchestratorConfig, RunSummary, ScriptExecutor, StatusReport,
};
use buildseq_state::{CheckpointStore, FsCheckpointStore, RunInfo};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use uuid::Uuid;

/// Config file picked up from the working directory when `--config` is not given.
const DEFAULT_CONFIG: &str = "buildseq.toml";

#[derive(Parser)]
#[command(name = "buildseq")]
#[command(version = buildseq_core::VERSION)]
#[command(about = "Dependency-ordered, phase-sequenced package builds with checkpoint and resume", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "BUILDSEQ_LOG_JSON")]
    json_logs: bool,

    /// Orchestrator config file (TOML)
    #[arg(short, long, global = true, env = "BUILDSEQ_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint directory (overrides `state_dir` from the config)
    #[arg(long, global = true, env = "BUILDSEQ_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Report format on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every package of a manifest
    ///
    /// Phases already recorded as finished in the checkpoint are not run
    /// again; use `reset` first for a clean build.
    Run {
        /// Manifest file (TOML or JSON)
        manifest: PathBuf,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Continue the run recorded in the state directory
    Resume {
        /// Use this manifest instead of the one recorded at run start
        #[arg(long)]
        manifest: Option<PathBuf>,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Show checkpointed progress per package
    Status {
        /// Manifest to order the report by (default: the recorded one)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Print the build plan without executing anything
    Plan {
        /// Manifest file (TOML or JSON)
        manifest: PathBuf,
    },

    /// Rewrite the checkpoint log keeping only the latest record per phase
    Compact,

    /// Delete the checkpoint and run metadata
    Reset {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunOverrides {
    /// Packages building at the same time
    #[arg(short = 'j', long, env = "BUILDSEQ_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Directory holding `<package>/<phase>.sh` build scripts
    #[arg(long, env = "BUILDSEQ_SCRIPTS_DIR")]
    scripts_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(log_format, level);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.state_dir)?;
    match cli.command {
        Commands::Run {
            manifest,
            overrides,
        } => cmd_run(config, &manifest, overrides, cli.format).await,
        Commands::Resume {
            manifest,
            overrides,
        } => cmd_resume(config, manifest.as_deref(), overrides, cli.format).await,
        Commands::Status { manifest } => cmd_status(&config, manifest.as_deref(), cli.format).await,
        Commands::Plan { manifest } => cmd_plan(&config, &manifest, cli.format),
        Commands::Compact => cmd_compact(&config).await,
        Commands::Reset { yes } => cmd_reset(&config, yes).await,
    }
}

fn load_config(path: Option<&Path>, state_dir: Option<PathBuf>) -> Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => OrchestratorConfig::load(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config {DEFAULT_CONFIG}"))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    Ok(config)
}

fn apply_overrides(config: &mut OrchestratorConfig, overrides: RunOverrides) -> Result<()> {
    if let Some(max) = overrides.max_concurrent {
        config.max_concurrent_packages = max;
    }
    if let Some(dir) = overrides.scripts_dir {
        config.scripts_dir = dir;
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

/// Resolve a path against the working directory. Build scripts run in their
/// own work directory, so every path handed to them must be absolute.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

fn open_store(config: &OrchestratorConfig) -> Result<FsCheckpointStore> {
    FsCheckpointStore::open(&config.state_dir)
        .with_context(|| format!("Failed to open state directory {}", config.state_dir.display()))
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))
}

async fn cmd_run(
    mut config: OrchestratorConfig,
    manifest_path: &Path,
    overrides: RunOverrides,
    format: OutputFormat,
) -> Result<ExitCode> {
    apply_overrides(&mut config, overrides)?;
    let manifest = load_manifest(manifest_path)?;
    let store = open_store(&config)?;

    if let Some(previous) = store.read_run_info().await? {
        if previous.manifest_digest != manifest.digest() {
            warn!(
                previous_run = %previous.run_id,
                previous_manifest = %previous.manifest_path.display(),
                "manifest differs from the one the checkpoint was written for"
            );
        }
    }

    let info = RunInfo {
        run_id: Uuid::new_v4(),
        manifest_path: absolute(manifest_path)?,
        manifest_digest: manifest.digest().to_string(),
        started_at: Utc::now(),
    };
    store.write_run_info(&info).await?;
    info!(run_id = %info.run_id, manifest = %info.manifest_path.display(), "starting run");

    execute(config, manifest, store, info.run_id, format).await
}

async fn cmd_resume(
    mut config: OrchestratorConfig,
    manifest_override: Option<&Path>,
    overrides: RunOverrides,
    format: OutputFormat,
) -> Result<ExitCode> {
    apply_overrides(&mut config, overrides)?;
    let store = open_store(&config)?;
    let Some(mut info) = store.read_run_info().await? else {
        bail!(
            "No run recorded in {}; start one with `buildseq run <manifest>`",
            config.state_dir.display()
        );
    };

    let manifest = match manifest_override {
        Some(path) => {
            let manifest = load_manifest(path)?;
            info.manifest_path = absolute(path)?;
            info.manifest_digest = manifest.digest().to_string();
            store.write_run_info(&info).await?;
            manifest
        }
        None => {
            let manifest = load_manifest(&info.manifest_path)?;
            if manifest.digest() != info.manifest_digest {
                warn!(
                    manifest = %info.manifest_path.display(),
                    "manifest changed since the run started"
                );
            }
            manifest
        }
    };
    info!(run_id = %info.run_id, "resuming run");

    execute(config, manifest, store, info.run_id, format).await
}

async fn execute(
    mut config: OrchestratorConfig,
    manifest: Manifest,
    store: FsCheckpointStore,
    run_id: Uuid,
    format: OutputFormat,
) -> Result<ExitCode> {
    config.scripts_dir = absolute(&config.scripts_dir)?;
    config.work_dir = absolute(&config.work_dir)?;
    config.log_dir = absolute(&config.log_dir)?;
    if let Some(dir) = &config.source_dir {
        config.source_dir = Some(absolute(dir)?);
    }
    let executor = Arc::new(ScriptExecutor::new(config.executor_config()));

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::from_config(manifest, &config, Arc::new(store), executor)?
        .with_cancellation(cancel.clone())
        .with_run_id(run_id);

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight phases");
            cancel.cancel();
        }
    });
    let result = orchestrator.run().await;
    watcher.abort();

    let summary = result?;
    print_report(&summary, format)?;
    Ok(summary_exit_code(&summary))
}

fn summary_exit_code(summary: &RunSummary) -> ExitCode {
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn cmd_status(
    config: &OrchestratorConfig,
    manifest_path: Option<&Path>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let store = open_store(config)?;
    let checkpoint = store.load_all().await?;

    let recorded = match manifest_path {
        Some(path) => Some(path.to_path_buf()),
        None => store.read_run_info().await?.map(|info| info.manifest_path),
    };
    let planned = match recorded {
        Some(path) => {
            let manifest = load_manifest(&path)?;
            let plan = plan_for(config, &manifest)?;
            Some((manifest, plan))
        }
        None => None,
    };

    let report = StatusReport::new(&checkpoint, planned.as_ref().map(|(m, p)| (m, p)));
    print_report(&report, format)?;
    if report.has_failures() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn plan_for(config: &OrchestratorConfig, manifest: &Manifest) -> Result<BuildPlan> {
    let graph = DependencyGraph::build(manifest)?;
    Ok(graph.build_plan(config.group_ordering)?)
}

fn cmd_plan(config: &OrchestratorConfig, manifest_path: &Path, format: OutputFormat) -> Result<ExitCode> {
    let manifest = load_manifest(manifest_path)?;
    let plan = plan_for(config, &manifest)?;
    print_report(&plan, format)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_compact(config: &OrchestratorConfig) -> Result<ExitCode> {
    let store = open_store(config)?;
    let kept = store.compact().await?;
    println!("Compacted checkpoint to {kept} records");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_reset(config: &OrchestratorConfig, yes: bool) -> Result<ExitCode> {
    if !yes {
        bail!(
            "Refusing to delete the checkpoint in {} without --yes",
            config.state_dir.display()
        );
    }
    let store = open_store(config)?;
    store.clear().await?;
    println!("Checkpoint in {} cleared", config.state_dir.display());
    Ok(ExitCode::SUCCESS)
}

fn print_report<T: Serialize + std::fmt::Display>(report: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

//! AC-CDD - automated implement → test → audit → fix cycles
//!
//! The `ac-cdd` command drives cycles whose inputs already sit in the
//! artifact store.
//!
//! ## Commands
//!
//! - `run`: drive one cycle to `Done` or `Failed`
//! - `queue`: drive several cycles concurrently
//! - `show`: print the archived record of a cycle
//! - `config`: print the effective settings
//!
//! Outcomes and records go to stdout as JSON; logs go to stderr.

mod exit_codes;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use accdd_core::metrics::METRICS;
use accdd_core::{
    init_tracing, load_settings, BranchLocks, CancelSignal, CommandAgent, CommandAuditor,
    CommandQaAnalyst, CommitteeAuditor, ControllerOptions, CycleConfig, CycleController,
    CycleDeps, CycleJob, CycleOutcome, CycleQueue, GitIntegrator, LocalSandboxProvider, Settings,
    DEFAULT_CONFIG_FILE,
};
use accdd_store::{ArtifactStore, CycleId, FsArtifactStore};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "ac-cdd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Automated implement → test → audit → fix cycles", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (missing file means defaults)
    #[arg(short, long, global = true, env = "ACCDD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that can be overridden per invocation.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Fix iterations allowed per cycle
    #[arg(long, global = true, env = "ACCDD_MAX_ITERATIONS")]
    max_iterations: Option<u32>,

    /// Rejections allowed per committee position
    #[arg(long, global = true, env = "ACCDD_REVIEWS_PER_AUDITOR")]
    reviews_per_auditor: Option<u32>,

    /// Re-run the whole committee after every fix
    #[arg(long, global = true, env = "ACCDD_RESTART_COMMITTEE_ON_FIX")]
    restart_committee_on_fix: Option<bool>,

    /// Branch accepted diffs are merged into
    #[arg(long, global = true, env = "ACCDD_INTEGRATION_BRANCH")]
    branch: Option<String>,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(n) = self.max_iterations {
            settings.max_iterations = n;
        }
        if let Some(n) = self.reviews_per_auditor {
            settings.reviews_per_auditor = n;
        }
        if let Some(restart) = self.restart_committee_on_fix {
            settings.restart_committee_on_fix = restart;
        }
        if let Some(branch) = &self.branch {
            settings.integration_branch = branch.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one cycle to a terminal state
    Run {
        /// Cycle id (its inputs must already be in the artifact store)
        cycle_id: String,
    },

    /// Drive several cycles concurrently; merges into one branch are serialized
    Queue {
        /// Cycle ids, in the order outcomes are reported
        #[arg(required = true)]
        cycle_ids: Vec<String>,

        /// Cycles running at the same time
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
    },

    /// Print the archived record of a cycle
    Show {
        cycle_id: String,
    },

    /// Print the effective settings as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let settings = match effective_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %format!("{e:#}"), "invalid configuration");
            eprintln!("error: {e:#}");
            return ExitCode::from(exit_codes::INVALID);
        }
    };

    match dispatch(cli.command, settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "ac-cdd failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_codes::FAILED)
        }
    }
}

fn effective_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = load_settings(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    cli.overrides.apply(&mut settings);
    settings.validate().context("Invalid settings after overrides")?;
    Ok(settings)
}

async fn dispatch(command: Commands, settings: Settings) -> Result<u8> {
    match command {
        Commands::Run { cycle_id } => cmd_run(&settings, &cycle_id).await,
        Commands::Queue {
            cycle_ids,
            concurrency,
        } => cmd_queue(&settings, &cycle_ids, concurrency).await,
        Commands::Show { cycle_id } => cmd_show(&settings, &cycle_id).await,
        Commands::Config => cmd_config(&settings),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn open_store(settings: &Settings) -> Result<Arc<FsArtifactStore>> {
    let store = FsArtifactStore::new(&settings.artifacts_dir).with_context(|| {
        format!(
            "Failed to open artifact store at {}",
            settings.artifacts_dir.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn build_controller(settings: &Settings) -> Result<Arc<CycleController>> {
    let deps = CycleDeps {
        store: open_store(settings)?,
        sandbox: Arc::new(LocalSandboxProvider::new(settings.sandbox.root.clone())),
        agent: Arc::new(CommandAgent::new(settings.agent.command.clone())),
        qa: Arc::new(CommandQaAnalyst::new(settings.qa.command.clone())),
        integrator: Arc::new(GitIntegrator::new(&settings.repo_dir)),
        merge_locks: BranchLocks::new(),
    };
    Ok(Arc::new(CycleController::new(
        deps,
        ControllerOptions::from_settings(settings),
    )))
}

fn build_config(settings: &Settings) -> CycleConfig {
    let auditors = settings
        .auditors
        .iter()
        .map(|a| {
            Arc::new(CommandAuditor::new(&a.name, a.command.clone(), &a.strictness))
                as Arc<dyn CommitteeAuditor>
        })
        .collect();
    CycleConfig::from_settings(settings, auditors)
}

fn parse_cycle_id(raw: &str) -> Result<CycleId> {
    CycleId::new(raw).with_context(|| format!("Invalid cycle id {raw:?}"))
}

/// Signal that fires on Ctrl-C. In-flight cycles stop at their next
/// suspension point and still tear their sandbox down.
fn cancel_on_interrupt() -> CancelSignal {
    let (handle, signal) = CancelSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight cycles");
            handle.cancel();
        }
    });
    signal
}

fn print_outcomes(outcomes: &[CycleOutcome]) -> Result<()> {
    let json = if let [single] = outcomes {
        serde_json::to_string_pretty(single)?
    } else {
        serde_json::to_string_pretty(outcomes)?
    };
    println!("{json}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(settings: &Settings, cycle_id: &str) -> Result<u8> {
    let cycle_id = parse_cycle_id(cycle_id)?;
    let controller = build_controller(settings)?;
    let outcome = controller
        .run_cycle(
            cycle_id,
            &settings.integration_branch,
            build_config(settings),
            cancel_on_interrupt(),
        )
        .await;

    METRICS.flush();
    let outcomes = [outcome];
    print_outcomes(&outcomes)?;
    Ok(exit_codes::for_outcomes(&outcomes))
}

async fn cmd_queue(settings: &Settings, cycle_ids: &[String], concurrency: usize) -> Result<u8> {
    let config = build_config(settings);
    let jobs = cycle_ids
        .iter()
        .map(|raw| {
            Ok(CycleJob {
                cycle_id: parse_cycle_id(raw)?,
                integration_branch: settings.integration_branch.clone(),
                config: config.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let queue = CycleQueue::new(build_controller(settings)?, concurrency);
    let outcomes = queue.run_all(jobs, cancel_on_interrupt()).await;

    METRICS.flush();
    print_outcomes(&outcomes)?;
    Ok(exit_codes::for_outcomes(&outcomes))
}

async fn cmd_show(settings: &Settings, cycle_id: &str) -> Result<u8> {
    let cycle_id = parse_cycle_id(cycle_id)?;
    let store = open_store(settings)?;
    let Some(record) = store
        .get_record(&cycle_id)
        .await
        .with_context(|| format!("Failed to read record of cycle {cycle_id}"))?
    else {
        bail!("No archived record for cycle {cycle_id}");
    };
    info!(cycle_id = %cycle_id, status = ?record.status, "record loaded");
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(exit_codes::OK)
}

fn cmd_config(settings: &Settings) -> Result<u8> {
    print!(
        "{}",
        toml::to_string_pretty(settings).context("Failed to render settings")?
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ac-cdd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn overrides_replace_file_values() {
        let cli = parse(&[
            "--max-iterations",
            "7",
            "--restart-committee-on-fix",
            "true",
            "--branch",
            "develop",
            "run",
            "cycle-01",
        ]);
        let mut settings = Settings::default();
        cli.overrides.apply(&mut settings);
        assert_eq!(settings.max_iterations, 7);
        assert!(settings.restart_committee_on_fix);
        assert_eq!(settings.integration_branch, "develop");
        assert_eq!(settings.reviews_per_auditor, Settings::default().reviews_per_auditor);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&["run", "cycle-01", "--reviews-per-auditor", "4"]);
        assert_eq!(cli.overrides.reviews_per_auditor, Some(4));
        assert!(matches!(cli.command, Commands::Run { ref cycle_id } if cycle_id == "cycle-01"));
    }

    #[test]
    fn queue_requires_a_cycle() {
        assert!(Cli::try_parse_from(["ac-cdd", "queue"]).is_err());
        let cli = parse(&["queue", "a", "b", "--concurrency", "3"]);
        match cli.command {
            Commands::Queue {
                cycle_ids,
                concurrency,
            } => {
                assert_eq!(cycle_ids, vec!["a", "b"]);
                assert_eq!(concurrency, 3);
            }
            _ => panic!("expected queue"),
        }
    }

    #[test]
    fn config_lists_committee_in_order() {
        let config = build_config(&Settings::default());
        let names: Vec<&str> = config.auditors.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["auditor-1", "auditor-2", "auditor-3"]);
        assert_eq!(config.max_iterations, 3);
    }

    #[test]
    fn bad_cycle_id_is_reported() {
        assert!(parse_cycle_id("../escape").is_err());
    }
}

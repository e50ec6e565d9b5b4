//! rulegraph CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Execute workflow.yaml in the current directory
//! rulegraph
//!
//! # Preview what would run
//! rulegraph pipeline.yaml --dry-run
//!
//! # Build only one output and what it depends on
//! rulegraph pipeline.yaml results/report.txt
//!
//! # Run in another directory with 8 parallel jobs on 16 cores
//! rulegraph pipeline.yaml -d /data/analysis -j 8 -c 16
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::info;

use rulegraph::config::{DEFAULT_MAX_PARALLEL, DEFAULT_STATE_DIR};
use rulegraph::{load_workflow, Engine, RunConfig, RunSummary, Workflow, APP_NAME, VERSION};

/// Minimal workflow execution engine for declarative task graphs.
#[derive(Debug, Parser)]
#[command(name = "rulegraph", version, about)]
struct Cli {
    /// Workflow YAML file
    #[arg(default_value = "workflow.yaml")]
    workflow: PathBuf,

    /// Step ids or output files to build (default: everything)
    targets: Vec<String>,

    /// Print what would run without running it
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Maximum steps running at once
    #[arg(short, long, env = "RULEGRAPH_JOBS", default_value_t = DEFAULT_MAX_PARALLEL)]
    jobs: usize,

    /// Core budget shared by running steps (default: all CPUs)
    #[arg(short, long, env = "RULEGRAPH_CORES")]
    cores: Option<usize>,

    /// Run every step regardless of outputs or saved state
    #[arg(short = 'F', long)]
    force: bool,

    /// Keep running independent steps after a failure
    #[arg(short, long)]
    keep_going: bool,

    /// Directory steps run in and relative paths resolve against
    #[arg(short = 'd', long)]
    working_dir: Option<PathBuf>,

    /// While this file exists no new step starts
    #[arg(long)]
    pause_flag: Option<PathBuf>,

    /// Directory for resume state
    #[arg(long, env = "RULEGRAPH_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Print steps in execution order and exit
    #[arg(long)]
    list: bool,

    /// Print a Gantt chart of the run
    #[arg(long)]
    timeline: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn run_config(&self, working_dir: Option<PathBuf>) -> RunConfig {
        let defaults = RunConfig::default();
        RunConfig {
            max_parallel: self.jobs.max(1),
            max_threads: self.cores.unwrap_or(defaults.max_threads).max(1),
            dry_run: self.dry_run,
            force: self.force,
            keep_going: self.keep_going,
            working_dir,
            pause_flag_path: self.pause_flag.clone(),
            state_dir: self.state_dir.clone(),
            show_timeline: self.timeline,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Checks the working directory and makes it absolute.
fn resolve_working_directory(dir: Option<&PathBuf>) -> Result<Option<PathBuf>> {
    let Some(dir) = dir else {
        return Ok(None);
    };

    if !dir.exists() {
        bail!("Working directory does not exist: {}", dir.display());
    }
    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }

    let dir = dir
        .canonicalize()
        .with_context(|| format!("Could not resolve working directory {}", dir.display()))?;
    info!("Working directory: {}", dir.display());
    Ok(Some(dir))
}

/// Prints every step with its dependencies, in execution order.
fn print_steps(workflow: &Workflow) {
    for (i, step) in workflow.steps.iter().enumerate() {
        let deps = if step.previous.is_empty() {
            String::new()
        } else {
            format!(" <- {}", step.previous.join(", "))
        };
        println!("{:>3}. {}{}", i + 1, step.id.bold(), deps.dimmed());
    }
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    println!();
    let verb = if dry_run { "would run" } else { "executed" };
    println!(
        "{} {} {}, {} up to date ({:.2?})",
        "Workflow complete:".green().bold(),
        summary.executed.len(),
        verb,
        summary.skipped.len(),
        summary.elapsed
    );
}

fn run(cli: Cli) -> Result<()> {
    let working_dir = resolve_working_directory(cli.working_dir.as_ref())?;

    info!("Loading workflow: {}", cli.workflow.display());
    let mut workflow = load_workflow(&cli.workflow)
        .with_context(|| format!("Could not load workflow from '{}'", cli.workflow.display()))?;

    if !cli.targets.is_empty() {
        workflow
            .restrict_to_targets(&cli.targets)
            .context("Could not select targets")?;
    }

    info!(
        "Workflow loaded: {} steps{}",
        workflow.len(),
        workflow
            .name
            .as_deref()
            .map(|n| format!(" ({})", n))
            .unwrap_or_default()
    );

    if cli.list {
        print_steps(&workflow);
        return Ok(());
    }

    if cli.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }
    if let Some(path) = &cli.pause_flag {
        info!("Pause control: {}", path.display());
    }

    let config = cli.run_config(working_dir);
    let dry_run = config.dry_run;

    let mut engine = Engine::with_config(workflow, config);
    engine.set_workflow_path(cli.workflow.to_string_lossy());

    let summary = engine.run()?;
    print_summary(&summary, dry_run);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    info!("{} v{}", APP_NAME, VERSION);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::env;
    use std::sync::Mutex;

    /// Serializes tests that read or set `RULEGRAPH_*` variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let cli = Cli::try_parse_from(["rulegraph"]).unwrap();
        assert_eq!(cli.workflow, PathBuf::from("workflow.yaml"));
        assert!(cli.targets.is_empty());
        assert!(!cli.dry_run);
        assert_eq!(cli.state_dir, PathBuf::from(".rulegraph"));
    }

    #[test]
    fn test_cli_options() {
        let cli = Cli::try_parse_from([
            "rulegraph",
            "pipeline.yaml",
            "report.txt",
            "align",
            "-n",
            "-j",
            "8",
            "-c",
            "16",
            "-F",
            "-k",
            "--pause-flag",
            "/tmp/pause",
            "--timeline",
        ])
        .unwrap();

        assert_eq!(cli.workflow, PathBuf::from("pipeline.yaml"));
        assert_eq!(cli.targets, vec!["report.txt", "align"]);

        let config = cli.run_config(None);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.max_threads, 16);
        assert!(config.dry_run && config.force && config.keep_going && config.show_timeline);
        assert_eq!(config.pause_flag_path, Some(PathBuf::from("/tmp/pause")));
    }

    #[test]
    fn test_env_fallbacks() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("RULEGRAPH_JOBS", "6");
        env::set_var("RULEGRAPH_CORES", "3");
        env::set_var("RULEGRAPH_STATE_DIR", "/tmp/rulegraph-state");

        let from_env = Cli::try_parse_from(["rulegraph"]).unwrap();
        let overridden = Cli::try_parse_from(["rulegraph", "-j", "2"]).unwrap();

        env::remove_var("RULEGRAPH_JOBS");
        env::remove_var("RULEGRAPH_CORES");
        env::remove_var("RULEGRAPH_STATE_DIR");

        let config = from_env.run_config(None);
        assert_eq!(config.max_parallel, 6);
        assert_eq!(config.max_threads, 3);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/rulegraph-state"));
        assert_eq!(overridden.jobs, 2);
    }

    #[test]
    fn test_zero_jobs_clamped() {
        let cli = Cli::try_parse_from(["rulegraph", "-j", "0", "-c", "0"]).unwrap();
        let config = cli.run_config(None);
        assert_eq!(config.max_parallel, 1);
        assert_eq!(config.max_threads, 1);
    }

    #[test]
    fn test_missing_working_directory() {
        let missing = PathBuf::from("/definitely/not/here");
        assert!(resolve_working_directory(Some(&missing)).is_err());
        assert!(resolve_working_directory(None).unwrap().is_none());
    }
}

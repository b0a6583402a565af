//! Multi-model startup incubator.
//!
//! Runs founders, advisors and investors through a checkpointed three-stage
//! pipeline. Each run lives in its own directory (`out/run_<timestamp>`) and
//! can be resumed after a crash.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use incubator::core::types::Stage;
use incubator::exit_codes;
use incubator::io::checkpoint::CheckpointStore;
use incubator::io::config::{PipelineConfig, load_config, write_config};
use incubator::io::events::NoopSink;
use incubator::io::provider::build_providers;
use incubator::io::run_paths::{CONFIG_FILE, RunPaths};
use incubator::logging;
use incubator::pipeline::{PipelineOutcome, RunTarget, StageFailedError, run_pipeline};

#[derive(Parser)]
#[command(
    name = "incubator",
    version,
    about = "Checkpointed multi-model startup incubator pipeline"
)]
struct Cli {
    /// Pipeline config file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run.
    Run {
        /// Replace every provider with the deterministic mock.
        #[arg(long)]
        mock: bool,
        /// Parent directory for the run directory.
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Restrict ideas to one sector.
        #[arg(long)]
        sector: Option<String>,
    },
    /// Continue an interrupted run from its checkpoint.
    Resume {
        run_dir: PathBuf,
        #[arg(long)]
        mock: bool,
    },
    /// Show checkpoint progress of a run.
    Status { run_dir: PathBuf },
    /// Write a default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let result = match cli.command {
        Command::Run {
            mock,
            out_dir,
            concurrency,
            max_iterations,
            sector,
        } => load_config(&cli.config).and_then(|mut cfg| {
            if let Some(out_dir) = out_dir {
                cfg.out_dir = out_dir;
            }
            if let Some(concurrency) = concurrency {
                cfg.concurrency = concurrency;
            }
            if let Some(max_iterations) = max_iterations {
                cfg.max_iterations = max_iterations;
            }
            if sector.is_some() {
                cfg.sector_focus = sector;
            }
            cfg.validate()?;
            let target = RunTarget::Fresh {
                out_dir: cfg.out_dir.clone(),
            };
            Ok((cfg, target, mock))
        }),
        Command::Resume { run_dir, mock } => resume_config(&run_dir, &cli.config)
            .map(|cfg| (cfg, RunTarget::Resume(run_dir), mock)),
        Command::Status { run_dir } => return exit_code(cmd_status(&run_dir)),
        Command::InitConfig { force } => return exit_code(cmd_init_config(&cli.config, force)),
    };

    let (cfg, target, mock) = match result {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    let providers = match build_providers(&cfg, mock) {
        Ok(providers) => providers,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    match run_pipeline(&cfg, &providers, target, Arc::new(NoopSink)) {
        Ok(outcome) => {
            print_summary(&outcome);
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<StageFailedError>().is_some() {
                exit_codes::FAILED
            } else {
                exit_codes::INVALID
            }
        }
    }
}

fn exit_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}

/// Prefer the snapshot taken when the run started.
fn resume_config(run_dir: &Path, fallback: &Path) -> Result<PipelineConfig> {
    let snapshot = RunPaths::new(run_dir).config_snapshot_path;
    if snapshot.exists() {
        load_config(&snapshot)
    } else {
        load_config(fallback)
    }
}

fn cmd_status(run_dir: &Path) -> Result<()> {
    if !run_dir.is_dir() {
        bail!("run directory {} does not exist", run_dir.display());
    }
    let paths = RunPaths::new(run_dir);
    let checkpoint = CheckpointStore::new(&paths)
        .load()
        .with_context(|| format!("load checkpoint in {}", run_dir.display()))?;
    println!("run: {}", run_dir.display());
    println!("state: {}", checkpoint.state());
    for stage in Stage::ALL {
        let mark = if checkpoint.is_complete(stage) { "done" } else { "pending" };
        println!("{stage} ({}): {mark}", stage.title());
    }
    if !checkpoint.stage2_participants_done.is_empty() {
        let done: Vec<&str> = checkpoint
            .stage2_participants_done
            .iter()
            .map(String::as_str)
            .collect();
        println!("stage2 founders done: {}", done.join(", "));
    }
    if let Some(updated_at) = &checkpoint.updated_at {
        println!("updated: {updated_at}");
    }
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PipelineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn print_summary(outcome: &PipelineOutcome) {
    println!("run: {}", outcome.run_dir.display());
    for entry in &outcome.portfolio {
        match (entry.rank, &entry.reason) {
            (Some(rank), _) => println!(
                "#{rank} {} invest={} pass={} conviction={}",
                entry.participant,
                entry.invest,
                entry.pass,
                entry
                    .average_conviction
                    .map_or_else(|| "-".to_string(), |c| format!("{c:.1}"))
            ),
            (None, Some(reason)) => println!("{} {}: {reason}", entry.status.as_str(), entry.participant),
            (None, None) => println!("{} {}", entry.status.as_str(), entry.participant),
        }
    }
    if !outcome.failures.is_empty() {
        println!("failures: {}", outcome.failures.len());
    }
}

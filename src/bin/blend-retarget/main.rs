//! blend-retarget CLI - transfer animation between Blender rigs of different scale.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use blend_retarget::batch::{discover_sources, plan_jobs, validate_target, BatchDriver, BatchSummary};
use blend_retarget::config::TransferConfig;
use blend_retarget::job::TransferStatus;
use blend_retarget::orchestrator::{EngineCommand, Orchestrator};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Transfer animations between Blender files with rig scaling",
    after_help = "Output files are written next to each source as <source>_to_<target>.blend"
)]
struct Cli {
    /// Source .blend file, or a directory of .blend files
    source: PathBuf,

    /// Target .blend file (rig that receives the animation)
    target: PathBuf,

    /// Translation scale factor [default: 0.7]
    #[arg(short, long)]
    scale: Option<f64>,

    /// Per-job timeout in seconds [default: 600]
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Per-job resident memory cap in MB [default: 4096]
    #[arg(long)]
    max_memory: Option<u64>,

    /// Maximum frames to transfer [default: 10000]
    #[arg(long)]
    max_frames: Option<u32>,

    /// Maximum bones to transfer [default: 1000]
    #[arg(long)]
    max_bones: Option<u32>,

    /// Blender executable [default: blender on PATH]
    #[arg(short, long, env = "BLENDER")]
    blender: Option<PathBuf>,

    /// Keep processing remaining files after a failure
    #[arg(long)]
    continue_on_error: bool,

    /// JSON config file; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON summary of all jobs to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// Config file (if any) with command-line overrides applied.
    fn transfer_config(&self) -> Result<TransferConfig> {
        let mut config = match &self.config {
            Some(path) => TransferConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => TransferConfig::default(),
        };
        if let Some(v) = self.scale {
            config.scale = v;
        }
        if let Some(v) = self.timeout {
            config.timeout_secs = v;
        }
        if let Some(v) = self.max_memory {
            config.max_memory_mb = v;
        }
        if let Some(v) = self.max_frames {
            config.max_frames = v;
        }
        if let Some(v) = self.max_bones {
            config.max_bones = v;
        }
        if let Some(v) = &self.blender {
            config.blender = Some(v.clone());
        }
        config.continue_on_error |= self.continue_on_error;
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v/-q.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let config = cli.transfer_config()?;

    println!("Blender Animation Transfer");
    println!("{}", "=".repeat(50));
    println!("Source: {}", cli.source.display());
    println!("Target: {}", cli.target.display());
    println!("Scale:  {}", config.scale);
    println!(
        "Limits: {}s timeout, {}MB memory, {} frames, {} bones",
        config.timeout_secs, config.max_memory_mb, config.max_frames, config.max_bones
    );

    validate_target(&cli.target)?;
    let sources = discover_sources(&cli.source)?;
    let engine = EngineCommand::resolve(config.blender.as_deref())?;
    let orchestrator = Orchestrator::new(engine)?;

    let jobs = plan_jobs(&sources, &cli.target, &config);
    println!();
    println!("Processing {} source file(s)...", jobs.len());

    let summary = BatchDriver::new(orchestrator, config.continue_on_error).run(&jobs);
    print_summary(&summary);

    if let Some(path) = &cli.report {
        summary
            .write_json(path)
            .with_context(|| format!("writing report {}", path.display()))?;
        println!("Report: {}", path.display());
    }
    Ok(summary.is_success())
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!("{}", "=".repeat(60));
    println!("TRANSFER SUMMARY");
    println!("{}", "=".repeat(60));
    println!(
        "Succeeded: {}  Failed: {}  Skipped: {}  (of {})",
        summary.succeeded(),
        summary.failed(),
        summary.skipped(),
        summary.planned
    );
    if summary.stopped_early {
        println!("Stopped after the first failure; remaining files were not attempted.");
    }
    if summary.results.is_empty() {
        return;
    }

    println!();
    println!("Results:");
    for result in &summary.results {
        match result.status {
            TransferStatus::Success => {
                let stats = &result.stats;
                println!("✓ {}", result.name());
                println!("   → {}", result.output.display());
                println!(
                    "   {} bones, {} frames, {} keyframes{}",
                    stats.bones_mapped.saturating_sub(stats.bones_over_cap),
                    stats.frames_processed,
                    stats.keyframes_written,
                    if stats.truncated { " (frame range truncated)" } else { "" }
                );
                if stats.bones_unmapped > 0 {
                    println!("   {} source bones had no match in the target rig", stats.bones_unmapped);
                }
            }
            TransferStatus::Failed => {
                let kind = result.failure.map(|k| k.to_string()).unwrap_or_default();
                println!("✗ {} - {kind}", result.name());
                if let Some(detail) = &result.detail {
                    println!("   {detail}");
                }
            }
            TransferStatus::Skipped => {
                println!("- {} (skipped: {})", result.name(), result.detail.as_deref().unwrap_or_default());
            }
        }
    }
}

//! Command-line entry points for the ingestion jobs.
//!
//! Each subcommand is one independently scheduled job: `backfill` runs to
//! completion, `stream` runs until interrupted, and `monitor` is meant to be
//! invoked on a fixed schedule.

use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use gapless_core::BackfillOrchestrator;
use gapless_core::ChunkPlanner;
use gapless_core::Config;
use gapless_core::ConsistencyMonitor;
use gapless_core::GaplessErr;
use gapless_core::HeartbeatReporter;
use gapless_core::ScanOutcome;
use gapless_core::ScanStatus;
use gapless_core::SequenceRange;
use gapless_core::SequenceStore;
use gapless_core::Streamer;
use gapless_core::find_gapless_home;
use gapless_core::heartbeat::LivenessPinger;
use gapless_core::heartbeat::diagnostic_body;
use gapless_core::source::build_source;
use gapless_state::StateRuntime;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Exit code for a monitor run that could not scan the store.
pub const SCAN_FAILED_EXIT_CODE: u8 = 2;

/// Keeps a block store gapless and fresh.
#[derive(Debug, Parser)]
#[command(author, version, bin_name = "gapless")]
pub struct Cli {
    /// Directory holding `config.toml` and the store. Defaults to
    /// `$GAPLESS_HOME` or `~/.gapless`.
    #[arg(long = "home", global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Also append logs to this file.
    #[arg(long = "log-file", global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a historical range in memory-bounded chunks, resuming from the
    /// last checkpoint.
    Backfill(BackfillArgs),

    /// Scan for gaps and staleness, then signal the heartbeat endpoints.
    Monitor(MonitorArgs),

    /// Follow the upstream head and write new blocks as they arrive.
    Stream(StreamArgs),

    /// Drop physical copies superseded by a newer write.
    Compact,

    /// Print store coverage and backfill checkpoints.
    Status,

    /// Print the canonical copy of one block as JSON.
    Show(ShowArgs),

    /// Delete a backfill checkpoint so the next run starts over.
    ClearCheckpoint(ClearCheckpointArgs),
}

#[derive(Debug, Args)]
pub struct BackfillArgs {
    /// First block number, inclusive.
    #[arg(long)]
    pub start: u64,

    /// Last block number, inclusive.
    #[arg(long)]
    pub end: u64,

    /// Split calendar units above this many records.
    #[arg(long = "chunk-records", value_name = "N")]
    pub chunk_records: Option<u64>,

    /// Checkpoint key. Defaults to `backfill:<start>-<end>`.
    #[arg(long = "job-id")]
    pub job_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// First block number to scan. Defaults to the lowest stored block.
    #[arg(long)]
    pub start: Option<u64>,

    /// Last block number to scan. Defaults to the highest stored block.
    #[arg(long, requires = "start")]
    pub end: Option<u64>,

    /// Skip heartbeat pings even when endpoints are configured.
    #[arg(long = "no-heartbeat", default_value_t = false)]
    pub no_heartbeat: bool,
}

#[derive(Debug, Args)]
pub struct StreamArgs {
    /// First block to stream. Defaults to one past the newest stored block.
    #[arg(long = "start-from")]
    pub start_from: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    pub number: u64,
}

#[derive(Debug, Args)]
pub struct ClearCheckpointArgs {
    pub job_id: String,
}

pub async fn run_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let _log_guard = init_logging(cli.log_file.as_deref())?;
    let gapless_home = match cli.home {
        Some(home) => home,
        None => find_gapless_home()?,
    };
    let config = Config::load(gapless_home)?;

    match cli.command {
        Command::Backfill(args) => run_backfill(&config, args).await,
        Command::Monitor(args) => run_monitor(config, args).await,
        Command::Stream(args) => run_stream(&config, args).await,
        Command::Compact => run_compact(&config).await,
        Command::Status => run_status(&config).await,
        Command::Show(args) => run_show(&config, args).await,
        Command::ClearCheckpoint(args) => run_clear_checkpoint(&config, args).await,
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = "info";
    let env_filter = || {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

async fn run_backfill(config: &Config, args: BackfillArgs) -> anyhow::Result<ExitCode> {
    let range = SequenceRange::new(args.start, args.end)?;
    let mut planner_config = config.planner.clone();
    if let Some(chunk_records) = args.chunk_records {
        planner_config.chunk_records = Some(chunk_records);
    }
    let planner = ChunkPlanner::new(planner_config)?;
    let source = build_source(config.require_source()?)?;
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;

    let summary = BackfillOrchestrator::new(planner, config.retry.clone())
        .with_job_id(args.job_id)
        .run(range, source.as_ref(), runtime.as_ref(), runtime.as_ref())
        .await?;

    println!(
        "backfill {} complete: {} of {} chunks committed, {} records written, {} superseded copies compacted",
        summary.job_id,
        summary.chunks_committed,
        summary.chunks_planned,
        summary.records_written,
        summary.copies_compacted
    );
    if let Some(boundary) = summary.last_completed_boundary {
        println!("checkpoint: {boundary}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_monitor(mut config: Config, args: MonitorArgs) -> anyhow::Result<ExitCode> {
    let window = match (args.start, args.end) {
        (Some(start), Some(end)) => Some(SequenceRange::new(start, end)?),
        (start, _) => {
            if start.is_some() {
                config.monitor.start_sequence = start;
            }
            None
        }
    };
    let gap_report_limit = config.monitor.gap_report_limit;
    let reporter = if args.no_heartbeat {
        None
    } else {
        HeartbeatReporter::from_toml(&config.heartbeat, gap_report_limit)?
    };
    if reporter.is_none() {
        info!("no heartbeat endpoint configured; results are only printed");
    }

    let monitor = ConsistencyMonitor::new(config.monitor.clone());
    let outcome = match StateRuntime::init(config.state_dir.clone()).await {
        Ok(runtime) => monitor.scan(runtime.as_ref(), window).await,
        Err(err) => {
            error!("failed to open store for scan: {err:#}");
            ScanOutcome::Failed(GaplessErr::Store {
                operation: "open",
                message: format!("{err:#}"),
            })
        }
    };

    if let Some(reporter) = reporter {
        let ping = reporter.report(&outcome).await;
        info!("heartbeat: {ping:?}");
    }

    match &outcome {
        ScanOutcome::Completed(report) => print!("{}", diagnostic_body(report, gap_report_limit)),
        ScanOutcome::Failed(err) => eprintln!("scan failed: {err}"),
    }
    if outcome.status() == ScanStatus::ScanFailed {
        return Ok(ExitCode::from(SCAN_FAILED_EXIT_CODE));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_stream(config: &Config, args: StreamArgs) -> anyhow::Result<ExitCode> {
    let source = build_source(config.require_source()?)?;
    let mut stream_config = config.stream.clone();
    if args.start_from.is_some() {
        stream_config.start_from = args.start_from;
    }
    let liveness = stream_config
        .heartbeat_url
        .as_deref()
        .map(|url| LivenessPinger::from_config("stream.heartbeat_url", url, None))
        .transpose()?;
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;
    let store: Arc<dyn SequenceStore> = runtime;

    let summary = Streamer::new(source, store, stream_config)
        .with_liveness(liveness)
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    println!(
        "stream stopped after {} polls: {} records seen, {} written, next block {:?}",
        summary.polls, summary.records_seen, summary.records_written, summary.next_number
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_compact(config: &Config) -> anyhow::Result<ExitCode> {
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;
    let removed = runtime.compact().await?;
    println!("removed {removed} superseded copies");
    Ok(ExitCode::SUCCESS)
}

async fn run_status(config: &Config) -> anyhow::Result<ExitCode> {
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;
    let stats = runtime.canonical_stats().await?;
    let raw = runtime.raw_write_count().await?;
    let latest = runtime.max_observed_at().await?;

    println!("blocks: {}", stats.total);
    match (stats.min, stats.max) {
        (Some(min), Some(max)) => println!("range: {min}-{max}"),
        _ => println!("range: empty"),
    }
    println!("missing: {}", stats.missing());
    println!("completeness: {:.4}%", stats.completeness_pct());
    println!("physical copies: {raw}");
    match latest {
        Some(latest) => println!("latest observed_at: {}", latest.to_rfc3339()),
        None => println!("latest observed_at: none"),
    }

    let checkpoints = runtime.list_checkpoints().await?;
    if checkpoints.is_empty() {
        println!("checkpoints: none");
    } else {
        println!("checkpoints:");
        for checkpoint in checkpoints {
            let boundary = checkpoint
                .last_completed_boundary
                .map_or_else(|| "nothing committed".to_string(), |b| b.to_string());
            println!(
                "  {} -> {boundary} (run {}, updated {})",
                checkpoint.job_id,
                checkpoint.run_id,
                checkpoint.updated_at.to_rfc3339()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_show(config: &Config, args: ShowArgs) -> anyhow::Result<ExitCode> {
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;
    match runtime.get_block(args.number).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("block {} is not stored", args.number);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_clear_checkpoint(
    config: &Config,
    args: ClearCheckpointArgs,
) -> anyhow::Result<ExitCode> {
    let runtime = StateRuntime::init(config.state_dir.clone()).await?;
    if runtime.delete_checkpoint(&args.job_id).await? {
        println!("cleared checkpoint {}", args.job_id);
    } else {
        println!("no checkpoint named {}", args.job_id);
    }
    Ok(ExitCode::SUCCESS)
}

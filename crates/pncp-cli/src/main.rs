use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use pncp_adapters::{ContractSource, FixtureSource};
use pncp_sync::{ExtractionMode, HarvestConfig, Harvester, LogFormat};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pncp")]
#[command(about = "Incremental PNCP contract harvester")]
struct Cli {
    /// YAML configuration file; defaults to ./pncp.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract pending dates (the default command).
    Extract(ExtractArgs),
    /// Rebuild the deduplicated full-history file.
    Consolidate,
    /// Conform every partition file to one canonical schema.
    Repair(RepairArgs),
    /// Print the extraction state and the dates still pending.
    State,
}

#[derive(Debug, Default, Args)]
struct ExtractArgs {
    /// Fill every unprocessed date since the start date.
    #[arg(long, conflicts_with = "date")]
    historical: bool,
    /// Extract exactly this date (YYYY-MM-DD).
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDate>,
    /// Derive state from partition files when the state file is missing.
    #[arg(long)]
    rebuild_state: bool,
    /// Read `<dir>/YYYY-MM-DD.json` pages instead of calling the API.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RepairArgs {
    #[arg(long)]
    prefix: Option<String>,
    /// Derive the profile from at most this many files.
    #[arg(long)]
    sample: Option<usize>,
    /// Derive the profile from this single file.
    #[arg(long, conflicts_with = "sample")]
    reference: Option<String>,
}

/// How a command that did not error ended.
enum Status {
    Clean,
    Partial,
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn init_tracing(config: &HarvestConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match HarvestConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };
    init_tracing(&config);

    match run(cli.command, config).await {
        Ok(Status::Clean) => ExitCode::SUCCESS,
        Ok(Status::Partial) => ExitCode::from(2),
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "run aborted");
            eprintln!("error: {message}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Option<Commands>, config: HarvestConfig) -> Result<Status> {
    let harvester = Harvester::open(config).await?;
    let today = Local::now().date_naive();

    match command.unwrap_or(Commands::Extract(ExtractArgs::default())) {
        Commands::Extract(args) => {
            let mode = match (args.date, args.historical) {
                (Some(date), _) => ExtractionMode::Dates(vec![date]),
                (None, true) => ExtractionMode::Historical,
                (None, false) => ExtractionMode::Incremental,
            };
            let source: Arc<dyn ContractSource> = match args.fixtures {
                Some(dir) => Arc::new(FixtureSource::new(dir)),
                None => harvester.api_source()?,
            };
            let summary = harvester
                .extract(source, mode, today, args.rebuild_state)
                .await?;
            println!(
                "extraction {}: attempted={} succeeded={} failed={} deferred={} records_fetched={} invalid={} records_written={}",
                summary.mode,
                summary.attempted,
                summary.succeeded,
                summary.failed.len(),
                summary.deferred.len(),
                summary.records_fetched,
                summary.invalid_records,
                summary.records_written,
            );
            println!(
                "filter: analysed={} approved={} rejected={} approval_rate={:.1}%",
                summary.filter.analysed,
                summary.filter.approved,
                summary.filter.rejected,
                summary.filter.approval_rate_percent,
            );
            for (group, count) in &summary.filter.top_groups {
                println!("  group {group}: {count}");
            }
            for failure in &summary.failed {
                println!("  failed {}: {}", failure.date, failure.error);
            }
            for date in &summary.deferred {
                println!("  deferred {date}");
            }
            Ok(if summary.is_clean() {
                Status::Clean
            } else {
                Status::Partial
            })
        }
        Commands::Consolidate => {
            let summary = harvester.consolidate().await?;
            println!(
                "consolidation: files={} rows_read={} rows_written={} duplicates_dropped={} failed={} output={}",
                summary.files,
                summary.rows_read,
                summary.rows_written,
                summary.duplicates_dropped,
                summary.failed.len(),
                summary.output_path.as_deref().unwrap_or("-"),
            );
            for failure in &summary.failed {
                println!("  failed {}: {}", failure.path, failure.error);
            }
            Ok(if summary.failed.is_empty() {
                Status::Clean
            } else {
                Status::Partial
            })
        }
        Commands::Repair(args) => {
            let mut options = harvester.config().repair_options();
            if let Some(prefix) = args.prefix {
                options.prefix = prefix;
            }
            if args.sample.is_some() {
                options.sample_size = args.sample;
            }
            if args.reference.is_some() {
                options.reference_file = args.reference;
            }
            let summary = harvester.repair(&options).await?;
            println!(
                "repair {}: files={} reconciled={} patched={} rebuilt={} conformant={} failed={}",
                options.prefix,
                summary.files,
                summary.reconciled,
                summary.patched,
                summary.rebuilt,
                summary.conformant,
                summary.failed.len(),
            );
            for failure in &summary.failed {
                println!("  failed {}: {}", failure.path, failure.error);
            }
            Ok(if summary.is_clean() {
                Status::Clean
            } else {
                Status::Partial
            })
        }
        Commands::State => {
            let tracker = harvester.load_state(false).await?;
            println!("{}", serde_json::to_string_pretty(tracker.state())?);
            let pending = tracker.pending_dates(today);
            let missing = tracker.missing_dates(today);
            println!(
                "start_date={} processed={} pending={} missing={}",
                tracker.start_date(),
                tracker.state().processed_dates.len(),
                pending.len(),
                missing.len(),
            );
            if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
                println!("  pending {first}..={last}");
            }
            Ok(Status::Clean)
        }
    }
}

//! ChainSync CLI: sync, plan and status commands.
//!
//! Commands:
//! - `sync`: bring datasets up to date from a TOML config or ad-hoc flags
//! - `plan`: resolve gaps and print the fetch windows without fetching data
//! - `status`: list datasets on disk with rows, range and content hash

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use chainsync_core::config::{InstrumentConfig, ProviderConfig, SyncConfig, UnitExpansion};
use chainsync_core::data::{DatasetStore, ThetaProvider};
use chainsync_core::domain::{AspectGroup, InstrumentKind, Timeframe};
use chainsync_core::sync::{LogProgress, SyncMode, SyncOrchestrator, SyncReport, UnitPlan};

#[derive(Parser)]
#[command(
    name = "chainsync",
    about = "ChainSync: incremental options and underlying data sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch missing data and merge it into the datasets.
    Sync(SyncArgs),
    /// Resolve gaps and print fetch windows; no data is fetched.
    Plan(SyncArgs),
    /// List datasets with rows, time range and content hash.
    Status {
        /// Dataset directory.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

/// Either `--config` or `--symbol`/`--start`. Flags given alongside a config
/// file override its top-level settings.
#[derive(Args)]
struct SyncArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Symbols to sync (e.g., SPY,SPX).
    #[arg(long, value_delimiter = ',')]
    symbol: Vec<String>,

    /// Instrument kind; resolved from the provider's root lists when omitted.
    #[arg(long)]
    kind: Option<InstrumentKind>,

    /// Timeframes (daily, 1minute, 5minute, 1hour, ...).
    #[arg(long, value_delimiter = ',', default_value = "daily")]
    timeframes: Vec<Timeframe>,

    /// Aspect groups (underlying, options, greeks, open_interest).
    #[arg(long, value_delimiter = ',', default_value = "underlying")]
    groups: Vec<AspectGroup>,

    /// Start date (YYYY-MM-DD). Required without --config.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// End date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// tail or full_gap.
    #[arg(long)]
    mode: Option<SyncMode>,

    /// Dataset directory. Defaults to ./data.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// ThetaData terminal URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Worker pool size.
    #[arg(long)]
    workers: Option<usize>,
}

impl SyncArgs {
    fn into_config(self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                if !self.symbol.is_empty() {
                    bail!("--config and --symbol are mutually exclusive");
                }
                SyncConfig::from_file(path)?
            }
            None => {
                if self.symbol.is_empty() {
                    bail!("one of --config or --symbol is required");
                }
                let Some(start) = self.start else {
                    bail!("--start is required with --symbol");
                };
                SyncConfig {
                    data_dir: PathBuf::from("data"),
                    mode: SyncMode::default(),
                    workers: 4,
                    fetch_granularity: Default::default(),
                    restrict_to_available_dates: false,
                    provider: ProviderConfig::default(),
                    instruments: self
                        .symbol
                        .iter()
                        .map(|symbol| InstrumentConfig {
                            symbol: symbol.clone(),
                            kind: self.kind,
                            timeframes: self.timeframes.clone(),
                            groups: self.groups.clone(),
                            start,
                            end: self.end,
                            contracts: Vec::new(),
                        })
                        .collect(),
                }
            }
        };

        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(url) = self.base_url {
            config.provider.base_url = url;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chainsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync(args.into_config()?),
        Commands::Plan(args) => run_plan(args.into_config()?),
        Commands::Status { data_dir } => run_status(&data_dir),
    }
}

fn connect(config: &SyncConfig) -> Result<(ThetaProvider, UnitExpansion)> {
    let provider = config
        .provider
        .build()
        .context("failed to build ThetaData client")?;
    let today = chrono::Local::now().date_naive();
    let expansion = config.units(&provider, today)?;
    info!(
        provider = %provider.base_url(),
        data_dir = %config.data_dir.display(),
        mode = %config.mode,
        units = expansion.units.len(),
        unresolved = expansion.unresolved.len(),
        "planned units"
    );
    Ok((provider, expansion))
}

fn run_sync(config: SyncConfig) -> Result<()> {
    let (provider, expansion) = connect(&config)?;
    let orchestrator = SyncOrchestrator::new(
        &provider,
        DatasetStore::new(&config.data_dir),
        config.options(),
    );

    let mut report = orchestrator.run_all(&expansion.units, None, Some(&LogProgress))?;
    report.unresolved = expansion.unresolved;
    print_report(&report);

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_plan(config: SyncConfig) -> Result<()> {
    let (provider, expansion) = connect(&config)?;
    let orchestrator = SyncOrchestrator::new(
        &provider,
        DatasetStore::new(&config.data_dir),
        config.options(),
    );

    let mut failed = !expansion.unresolved.is_empty();
    for unresolved in &expansion.unresolved {
        eprintln!("{}: {}", unresolved.symbol, unresolved.error);
    }
    for (unit, plan) in expansion.units.iter().zip(orchestrator.plan_all(&expansion.units)) {
        match plan {
            Ok(plan) => print_plan(&plan),
            Err(e) => {
                failed = true;
                eprintln!("{unit}: {e}");
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        println!("Data directory does not exist: {}", data_dir.display());
        return Ok(());
    }

    let infos = DatasetStore::new(data_dir).list()?;
    if infos.is_empty() {
        println!("No datasets in {}", data_dir.display());
        return Ok(());
    }

    let total: u64 = infos.iter().map(|i| i.size_bytes).sum();
    println!("Data: {}", data_dir.display());
    println!("Datasets: {}", infos.len());
    println!("Total size: {}", format_size(total));
    println!();
    println!(
        "{:<36} {:>9} {:<43} {:>10} {:<16}",
        "Dataset", "Rows", "Range", "Size", "BLAKE3"
    );
    println!("{}", "-".repeat(118));
    for info in &infos {
        let range = match (info.first, info.last) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "(empty)".to_string(),
        };
        println!(
            "{:<36} {:>9} {:<43} {:>10} {:<16}",
            info.key.to_string(),
            info.rows,
            range,
            format_size(info.size_bytes),
            &info.content_hash[..16.min(info.content_hash.len())]
        );
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!();
    println!("=== Sync Report ===");
    for unresolved in &report.unresolved {
        println!("{:<36} {}", unresolved.symbol, unresolved);
    }
    for unit in &report.units {
        println!("{:<36} {}", unit.unit.to_string(), unit.outcome);
        for (aspect, rows) in &unit.rows_fetched {
            println!("    fetched {rows:>8} rows of {aspect}");
        }
        for warning in &unit.warnings {
            println!("    WARNING: {warning}");
        }
    }
    println!();
    println!(
        "Done: {}  Skipped: {}  Failed: {}",
        report.done(),
        report.skipped(),
        report.failed()
    );
}

fn print_plan(plan: &UnitPlan) {
    println!(
        "{} -> {} ({} existing, {} missing)",
        plan.unit,
        plan.path.display(),
        plan.existing_points,
        plan.missing.len()
    );
    if plan.windows.is_empty() {
        println!("    up to date");
    }
    for window in &plan.windows {
        println!("    fetch {window}");
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

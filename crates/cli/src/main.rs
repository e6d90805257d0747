use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metadata::PipelineConfig;
use pipeline::{RunReport, YearStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pipeline", version, about = "Yearly IPTU property-tax pipeline")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Raw extracts -> quarantine + identity links + Gold Parquet per year
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Restrict the run to these years (comma separated)
        #[arg(long, value_delimiter = ',')]
        years: Option<Vec<i32>>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// One year's extract -> Bronze IPC
    Ingest {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        year: i32,
    },
    /// Read every year's header and compile its field mapping; writes nothing
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn load(path: &Path) -> Result<Arc<PipelineConfig>> {
    let cfg = PipelineConfig::load(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    Ok(Arc::new(cfg))
}

fn print_report(report: &RunReport) {
    for y in &report.years {
        match &y.status {
            YearStatus::Completed => println!(
                "YEAR {} OK rows_in={} valid={} entities={} aggregate_rows={} trend_rows={}",
                y.year, y.rows_in, y.valid, y.entity_count, y.aggregate_rows, y.trend_rows
            ),
            YearStatus::Quarantined { count } => println!(
                "YEAR {} OK rows_in={} valid={} quarantined={} entities={} aggregate_rows={} trend_rows={}",
                y.year, y.rows_in, y.valid, count, y.entity_count, y.aggregate_rows, y.trend_rows
            ),
            YearStatus::Failed { stage, reason } => {
                println!("YEAR {} FAILED stage={} reason={}", y.year, stage, reason)
            }
        }
    }
    if !report.trend_refreshed.is_empty() {
        println!("TREND REFRESHED years={:?}", report.trend_refreshed);
    }
    if report.manifest_stale {
        println!("MANIFEST STALE (partitions written, years.json not updated)");
    }
}

async fn run(config: PathBuf, years: Option<Vec<i32>>, json: bool) -> Result<i32> {
    let cfg = load(&config)?;
    let report = tokio::select! {
        res = pipeline::run(cfg, years.as_deref()) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; years materialized so far are kept");
            return Ok(1);
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        println!("RUN {:?}", report.outcome);
    }
    Ok(report.exit_code())
}

async fn check_config(config: PathBuf) -> Result<i32> {
    let cfg = load(&config)?;
    let mut failed = 0;
    for check in pipeline::check_config(&cfg).await {
        match check.result {
            Ok(fields) => println!(
                "YEAR {} OK columns={} mapped_fields={}",
                check.year, check.columns, fields
            ),
            Err(reason) => {
                failed += 1;
                println!("YEAR {} ERROR {}", check.year, reason);
            }
        }
    }
    Ok(if failed == 0 { 0 } else { 1 })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let start = std::time::Instant::now();
    let code = match cli.cmd {
        Commands::Run {
            config,
            years,
            json,
        } => run(config, years, json).await?,
        Commands::Ingest { config, year } => {
            let cfg = load(&config)?;
            let stats = pipeline::ingest_year(&cfg, year).await?;
            println!(
                "INGEST OK year={} rows_in={} bytes_in={} out={}",
                year,
                stats.rows_in,
                stats.bytes_in,
                stats.out_path.display()
            );
            0
        }
        Commands::CheckConfig { config } => check_config(config).await?,
    };
    let duration_pretty = humantime::format_duration(start.elapsed());
    eprintln!("DONE in {}", duration_pretty);
    std::process::exit(code);
}

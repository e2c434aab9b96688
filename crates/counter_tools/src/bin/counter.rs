//! counter - operator CLI for the student counter ledger.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use counter_engines::metrics::PrometheusMetricsSink;
use counter_os::config::{ENV_CONFLICT_RETRIES, ENV_DATABASE_PATH};
use counter_storage::SqliteCounterLedger;
use counter_tools::counter_cli::{
    build_service, execute_assign, execute_audit, execute_backfill, load_config,
    write_metrics_snapshot,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "counter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Ledger database file (overrides COUNTER_DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Bind attempts after a conflict (overrides COUNTER_CONFLICT_RETRIES)
    #[arg(long)]
    conflict_retries: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Return the subject's counter, allocating one if needed
    Assign {
        national_id: String,

        /// 0/1 or an alias such as f, male, زن
        gender: String,

        /// Two-digit academic year code
        #[arg(long)]
        year: Option<String>,

        /// Write Prometheus text for the run to this file
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Reconcile a CSV of legacy rows against the ledger
    Backfill {
        /// CSV with national_id, stated_gender, stated_counter
        input: PathBuf,

        /// Report destination (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Plan only; the ledger is not touched
        #[arg(long)]
        dry_run: bool,

        /// Pin the academic year instead of resolving it from the clock
        #[arg(long)]
        year: Option<String>,

        /// Write Prometheus text for the run to this file
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Check ledger rows and sequence positions for consistency
    Audit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let mut overrides = BTreeMap::new();
    if let Some(path) = &cli.database {
        overrides.insert(ENV_DATABASE_PATH, path.display().to_string());
    }
    if let Some(n) = cli.conflict_retries {
        overrides.insert(ENV_CONFLICT_RETRIES, n.to_string());
    }
    let config = load_config(&overrides, |var| std::env::var(var).ok())
        .context("failed to load counter config")?;
    let ledger = Arc::new(
        SqliteCounterLedger::open(&config.database_path).with_context(|| {
            format!(
                "failed to open counter ledger at {}",
                config.database_path.display()
            )
        })?,
    );
    let metrics = Arc::new(PrometheusMetricsSink::new()?);

    match cli.command {
        Commands::Assign {
            national_id,
            gender,
            year,
            metrics_out,
        } => {
            let service = build_service(&config, ledger, metrics.clone(), None)?;
            let response = execute_assign(&service, &national_id, &gender, year.as_deref());
            println!("{}", serde_json::to_string(&response)?);
            if let Some(path) = metrics_out {
                write_metrics_snapshot(&metrics, &path)?;
            }
            if !response.ok {
                std::process::exit(1);
            }
        }
        Commands::Backfill {
            input,
            output,
            dry_run,
            year,
            metrics_out,
        } => {
            let service = build_service(&config, ledger, metrics.clone(), year.as_deref())?;
            let reader = BufReader::new(
                File::open(&input).with_context(|| format!("failed to open {}", input.display()))?,
            );
            let report = match &output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    execute_backfill(&service, reader, BufWriter::new(file), dry_run)?
                }
                None => execute_backfill(&service, reader, io::stdout().lock(), dry_run)?,
            };
            if let Some(path) = metrics_out {
                write_metrics_snapshot(&metrics, &path)?;
            }
            eprintln!(
                "backfill {}: {} rows, {} actions",
                if report.dry_run { "dry-run" } else { "applied" },
                report.rows.len(),
                report.actions().len()
            );
        }
        Commands::Audit => {
            let report = execute_audit(ledger.as_ref(), &config.codec()?)?;
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &report)?;
            writeln!(stdout)?;
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

//! JSONL / SQLite reconciliation tool.
//!
//! Diffs the two signal mirrors of a run and writes `parity_diff.json`.
//! Exits non-zero when the equivalence contract is violated, so it can gate
//! deploy pipelines.

use alphaflow_backend::sink::{parity_report, write_parity_report};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parity_diff", about = "Reconcile JSONL and SQLite signal mirrors")]
struct Args {
    #[arg(long)]
    jsonl_dir: PathBuf,
    #[arg(long)]
    sqlite_db: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(error = %err, "parity diff failed");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<bool> {
    let report = parity_report(&args.jsonl_dir, &args.sqlite_db, args.run_id.as_deref())?;
    let output = args.output.unwrap_or_else(|| {
        args.sqlite_db
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("parity_diff.json")
    });
    write_parity_report(&report, &output)?;

    info!(
        jsonl = report.jsonl_count,
        sqlite = report.sqlite_count,
        common = report.common_keys,
        agreement = format!("{:.4}", report.key_agreement_ratio),
        report = %output.display(),
        "parity report written"
    );
    for diff in &report.top_minute_diffs {
        warn!(
            minute = diff.minute,
            jsonl = diff.jsonl_count,
            sqlite = diff.sqlite_count,
            rel_diff = format!("{:.4}", diff.rel_diff),
            "minute count mismatch"
        );
    }
    Ok(report.within_tolerance())
}

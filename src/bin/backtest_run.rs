//! Standalone backtest runner.
//!
//! Thin wrapper over the `alphaflow backtest` subcommand for deploy scripts
//! that invoke the backtest directly:
//!
//! ```text
//! backtest_run --mode A --features-dir deploy/data/ofi_cvd/ready/features \
//!     --out-dir runs/bt1 --symbols BTCUSDT,ETHUSDT --gating-mode ignore_soft
//! ```

use alphaflow_backend::backtest::{BacktestMode, BacktestOptions, BacktestRunner};
use alphaflow_backend::config::Config;
use alphaflow_backend::strategy::{GatingMode, QualityMode};
use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backtest_run", about = "Deterministic backtest executor")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "A")]
    mode: String,
    #[arg(long)]
    features_dir: Option<PathBuf>,
    #[arg(long)]
    signals_src: Option<String>,
    #[arg(long)]
    out_dir: PathBuf,
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    #[arg(long, default_value = "strict")]
    gating_mode: String,
    #[arg(long)]
    reemit_signals: bool,
    #[arg(long)]
    ignore_gating: bool,
    #[arg(long)]
    run_id: Option<String>,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        }
    };
    match run(config, args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "backtest failed");
            ExitCode::from(1)
        }
    }
}

fn run(config: Config, args: Args) -> Result<()> {
    let mode = BacktestMode::parse(&args.mode)
        .ok_or_else(|| anyhow!("invalid --mode {:?} (expected A or B)", args.mode))?;
    let gating_mode = GatingMode::parse(&args.gating_mode)
        .ok_or_else(|| anyhow!("invalid --gating-mode {:?}", args.gating_mode))?;

    let options = BacktestOptions {
        mode,
        features_dir: args.features_dir,
        signals_src: args.signals_src,
        out_dir: args.out_dir,
        symbols: args.symbols,
        start_ms: None,
        end_ms: None,
        gating_mode: Some(gating_mode),
        quality_mode: QualityMode::All,
        reemit_signals: args.reemit_signals,
        ignore_gating: args.ignore_gating,
        legacy_score_only: false,
    };

    let run_id = args.run_id.unwrap_or_else(Config::resolve_run_id);
    let report = BacktestRunner::new(config, run_id).run(&options)?;
    println!(
        "run_id={} trades={} signals={} manifest={}",
        report.run_id,
        report.trades,
        report.signals,
        report.manifest_path.display()
    );
    Ok(())
}

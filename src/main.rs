//! AlphaFlow - Order-Flow Signal Pipeline & Backtester
//!
//! CLI entry point. Subcommands:
//! - `replay`: run recorded raw events through the live pipeline and sinks
//! - `backtest`: deterministic backtest over features (A) or signals (B)
//! - `parity`: reconcile the JSONL and SQLite signal mirrors
//!
//! Exit codes: 0 success, 1 runtime failure, 2 configuration/validation
//! error.

use alphaflow_backend::backtest::reader::DataReader;
use alphaflow_backend::backtest::{BacktestMode, BacktestOptions, BacktestRunner};
use alphaflow_backend::config::Config;
use alphaflow_backend::engine::PipelineEngine;
use alphaflow_backend::sink::{parity_report, write_parity_report};
use alphaflow_backend::strategy::{GatingMode, QualityMode};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "alphaflow", about = "Order-flow signal pipeline and backtester")]
struct Cli {
    /// JSON config file (defaults + env overrides otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recorded raw events through the live pipeline
    Replay(ReplayArgs),
    /// Run a deterministic backtest
    Backtest(BacktestArgs),
    /// Reconcile the JSONL and SQLite signal mirrors
    Parity(ParityArgs),
}

#[derive(Args)]
struct ReplayArgs {
    /// Raw event JSONL file, partition directory, or `-` for stdin
    #[arg(long)]
    input: String,
    #[arg(long)]
    out_dir: PathBuf,
    /// Override the run id (defaults to RUN_ID env or a fresh UUID)
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Args)]
struct BacktestArgs {
    /// A = features input, B = signals input
    #[arg(long, default_value = "A")]
    mode: String,
    #[arg(long)]
    features_dir: Option<PathBuf>,
    /// `jsonl://<dir>` or `sqlite://<db>`
    #[arg(long)]
    signals_src: Option<String>,
    #[arg(long)]
    out_dir: PathBuf,
    /// Comma-separated symbol filter
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    /// Inclusive start (RFC3339, `YYYY-MM-DDTHH:MM:SS`, or epoch ms)
    #[arg(long)]
    start: Option<String>,
    /// Exclusive end
    #[arg(long)]
    end: Option<String>,
    /// Timezone for naive --start/--end values
    #[arg(long, default_value = "UTC")]
    tz: String,
    #[arg(long, default_value = "strict")]
    gating_mode: String,
    #[arg(long, default_value = "all")]
    quality_mode: String,
    /// Re-emit produced signals into the out dir (mode A)
    #[arg(long)]
    reemit_signals: bool,
    /// Ignore all non-hard gating
    #[arg(long)]
    ignore_gating: bool,
    /// Legacy score-only regression mode
    #[arg(long)]
    legacy: bool,
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Args)]
struct ParityArgs {
    #[arg(long)]
    jsonl_dir: PathBuf,
    #[arg(long)]
    sqlite_db: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    /// Report path (defaults to parity_diff.json next to the db)
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Configuration problems are exit code 2, before anything runs.
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Command::Replay(args) => run_replay(config, args).await,
        Command::Backtest(args) => match build_backtest_options(&args) {
            Ok(options) => run_backtest(config, options, args.run_id),
            Err(err) => {
                error!(error = %err, "invalid backtest arguments");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        Command::Parity(args) => run_parity(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn run_replay(config: Config, args: ReplayArgs) -> Result<()> {
    let run_id = args.run_id.unwrap_or_else(Config::resolve_run_id);
    let engine = PipelineEngine::new(config.clone(), &run_id);

    let input_path = PathBuf::from(&args.input);
    let (lines, input_root) = if args.input == "-" {
        let stdin = std::io::stdin();
        let lines: Vec<String> = stdin.lock().lines().collect::<std::io::Result<_>>()?;
        (lines, None)
    } else if input_path.is_dir() {
        let prefer_preview = config.input_mode == alphaflow_backend::config::InputMode::Preview;
        let mut reader = DataReader::open(&input_path, prefer_preview)?;
        let lines = reader
            .read_rows()?
            .into_iter()
            .map(|value| value.to_string())
            .collect();
        (lines, Some(input_path.clone()))
    } else {
        let text = std::fs::read_to_string(&input_path)
            .with_context(|| format!("reading {}", input_path.display()))?;
        (lines_of(text), Some(input_path.clone()))
    };

    let report = engine.run(lines, &args.out_dir, input_root.as_deref()).await?;
    info!(
        run_id = %report.run_id,
        events = report.stats.events_ingested,
        signals = report.stats.signals_written,
        manifest = %report.manifest_path.display(),
        "replay finished"
    );
    Ok(())
}

fn run_backtest(config: Config, options: BacktestOptions, run_id: Option<String>) -> Result<()> {
    let run_id = run_id.unwrap_or_else(Config::resolve_run_id);
    let runner = BacktestRunner::new(config, run_id);
    let report = runner.run(&options)?;
    info!(
        run_id = %report.run_id,
        trades = report.trades,
        signals = report.signals,
        manifest = %report.manifest_path.display(),
        "backtest finished"
    );
    Ok(())
}

fn run_parity(args: ParityArgs) -> Result<()> {
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
        agreement = report.key_agreement_ratio,
        within_tolerance = report.within_tolerance(),
        report = %output.display(),
        "parity report written"
    );
    if report.within_tolerance() {
        Ok(())
    } else {
        Err(anyhow!("sink parity outside tolerance"))
    }
}

fn build_backtest_options(args: &BacktestArgs) -> Result<BacktestOptions> {
    let mode = BacktestMode::parse(&args.mode)
        .ok_or_else(|| anyhow!("invalid --mode {:?} (expected A or B)", args.mode))?;
    let gating_mode = GatingMode::parse(&args.gating_mode)
        .ok_or_else(|| anyhow!("invalid --gating-mode {:?}", args.gating_mode))?;
    let quality_mode = match args.quality_mode.as_str() {
        "conservative" => QualityMode::Conservative,
        "balanced" => QualityMode::Balanced,
        "aggressive" => QualityMode::Aggressive,
        "all" => QualityMode::All,
        other => return Err(anyhow!("invalid --quality-mode {:?}", other)),
    };
    match mode {
        BacktestMode::A if args.features_dir.is_none() => {
            return Err(anyhow!("--features-dir required for mode A"));
        }
        BacktestMode::B if args.signals_src.is_none() => {
            return Err(anyhow!("--signals-src required for mode B"));
        }
        _ => {}
    }

    let start_ms = args
        .start
        .as_deref()
        .map(|s| parse_time(s, &args.tz))
        .transpose()?;
    let end_ms = args
        .end
        .as_deref()
        .map(|s| parse_time(s, &args.tz))
        .transpose()?;

    Ok(BacktestOptions {
        mode,
        features_dir: args.features_dir.clone(),
        signals_src: args.signals_src.clone(),
        out_dir: args.out_dir.clone(),
        symbols: args.symbols.clone(),
        start_ms,
        end_ms,
        gating_mode: Some(gating_mode),
        quality_mode,
        reemit_signals: args.reemit_signals,
        ignore_gating: args.ignore_gating,
        legacy_score_only: args.legacy,
    })
}

/// Accepts epoch milliseconds, RFC3339, or a naive timestamp interpreted in
/// `tz`.
fn parse_time(value: &str, tz: &str) -> Result<i64> {
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| {
            NaiveDateTime::parse_from_str(&format!("{}T00:00:00", value), "%Y-%m-%dT%H:%M:%S")
        })
        .map_err(|_| anyhow!("unparseable time: {:?}", value))?;
    if tz == "UTC" {
        return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    let tz = Tz::from_str(tz).map_err(|_| anyhow!("invalid timezone: {:?}", tz))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .ok_or_else(|| anyhow!("ambiguous local time: {:?}", value))
}

fn lines_of(text: String) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

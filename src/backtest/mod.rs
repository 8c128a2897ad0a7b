//! Deterministic Backtest Executor
//!
//! Replays recorded data through the same decision stack the live pipeline
//! runs, simulates execution, and writes the run artifacts:
//!
//! - **Mode A**: aligned feature rows -> CoreAlgorithm -> strategy policy ->
//!   TradeSimulator.
//! - **Mode B**: previously persisted signals -> strategy policy ->
//!   TradeSimulator.
//!
//! Identical inputs and config produce byte-identical `trades.jsonl` and
//! `metrics.json` (fill randomness is seeded per draw).

pub mod feeder;
pub mod fees;
pub mod manifest;
pub mod metrics;
pub mod reader;
pub mod simulator;
pub mod slippage;


use crate::config::{Config, InputMode};
use crate::core_algorithm::CoreAlgorithm;
use crate::models::Millis;
use crate::signal::SignalV2;
use crate::sink::{JsonlSink, SignalSink};
use crate::strategy::{GatingMode, QualityMode, StrategyPolicy};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use feeder::ReplayFeeder;
use fees::FeeEngine;
use manifest::{DataFingerprint, ResourceUsage, RunManifest};
use metrics::MetricsAggregator;
use reader::{read_signals_src, DataReader, ReaderStats};
use simulator::TradeSimulator;
use slippage::SlippageModel;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Backtest input mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktestMode {
    /// Feature rows drive CoreAlgorithm, then the simulator.
    A,
    /// Persisted signals drive the simulator directly.
    B,
}

impl BacktestMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" | "a" => Some(BacktestMode::A),
            "B" | "b" => Some(BacktestMode::B),
            _ => None,
        }
    }
}

/// Resolved options for one backtest run.
#[derive(Debug, Clone)]
pub struct BacktestOptions {
    pub mode: BacktestMode,
    pub features_dir: Option<PathBuf>,
    pub signals_src: Option<String>,
    pub out_dir: PathBuf,
    pub symbols: Vec<String>,
    pub start_ms: Option<Millis>,
    pub end_ms: Option<Millis>,
    pub gating_mode: Option<GatingMode>,
    pub quality_mode: QualityMode,
    pub reemit_signals: bool,
    pub ignore_gating: bool,
    pub legacy_score_only: bool,
}

/// Summary returned to the CLI.
#[derive(Debug)]
pub struct BacktestReport {
    pub run_id: String,
    pub trades: usize,
    pub signals: u64,
    pub manifest_path: PathBuf,
}

/// One-shot backtest runner.
pub struct BacktestRunner {
    config: Config,
    run_id: String,
    config_hash: String,
}

impl BacktestRunner {
    pub fn new(config: Config, run_id: impl Into<String>) -> Self {
        let config_hash = config.config_hash();
        Self {
            config,
            run_id: run_id.into(),
            config_hash,
        }
    }

    pub fn run(&self, options: &BacktestOptions) -> Result<BacktestReport> {
        let started_at = Utc::now();
        fs::create_dir_all(&options.out_dir)
            .with_context(|| format!("creating {}", options.out_dir.display()))?;

        let policy = self.build_policy(options);
        let backtest = &self.config.backtest;
        let fee_engine = FeeEngine::new(
            backtest.fee_model,
            backtest.taker_fee_bps,
            self.config.fee_maker_taker.clone(),
            self.run_id.clone(),
        );
        let slippage = SlippageModel::new(backtest.slippage_model, backtest.slippage_bps);
        let mut simulator = TradeSimulator::new(backtest.clone(), policy, fee_engine, slippage);

        let mut reemit_sink = options.reemit_signals.then(|| {
            JsonlSink::new(
                options.out_dir.join("ready"),
                self.config.rotate.clone(),
                self.config.fsync_every_n,
            )
        });

        let mut manifest = RunManifest::new(&self.run_id, &self.config_hash);
        manifest.started_at = Some(started_at);

        let (reader_stats, feeder_stats, signal_count, fingerprint) = match options.mode {
            BacktestMode::A => {
                let features_dir = options
                    .features_dir
                    .as_deref()
                    .context("features_dir required for mode A")?;
                self.run_mode_a(options, features_dir, &mut simulator, &mut reemit_sink)?
            }
            BacktestMode::B => {
                let signals_src = options
                    .signals_src
                    .as_deref()
                    .context("signals_src required for mode B")?;
                self.run_mode_b(options, signals_src, &mut simulator, &mut reemit_sink)?
            }
        };

        simulator.close_all();
        if let Some(sink) = reemit_sink.as_mut() {
            sink.close()?;
        }

        // Execution log mirrors every fill into the partitioned ready tree.
        let mut execlog = JsonlSink::for_kind(
            options.out_dir.join("ready"),
            crate::paths::DataKind::Execlog,
            self.config.rotate.clone(),
            self.config.fsync_every_n,
        );
        for trade in simulator.trades() {
            let line = serde_json::to_string(&serde_json::json!({
                "ts_ms": trade.ts_ms,
                "symbol": trade.symbol,
                "event": "filled",
                "side": trade.side,
                "reason": trade.reason,
                "exec_px": trade.exec_px,
                "qty": trade.qty,
                "fee": trade.fee,
                "run_id": self.run_id,
            }))?;
            execlog.write_line(&trade.symbol, trade.ts_ms, &line)?;
        }
        execlog.close()?;

        // Artifacts: trades, metrics, daily pnl, scenario breakdown.
        let trades = simulator.trades().to_vec();
        let trades_path = options.out_dir.join("trades.jsonl");
        let mut trades_file = fs::File::create(&trades_path)
            .with_context(|| format!("creating {}", trades_path.display()))?;
        for trade in &trades {
            writeln!(trades_file, "{}", serde_json::to_string(trade)?)?;
        }
        trades_file.sync_all()?;

        let aggregator = MetricsAggregator::new(
            &backtest.rollover_timezone,
            backtest.rollover_hour,
        )?;
        let (run_metrics, daily) = aggregator.aggregate(&trades);
        aggregator.write_artifacts(&options.out_dir, &run_metrics, &daily)?;

        manifest.reader_stats = reader_stats;
        manifest.feeder_stats = feeder_stats;
        manifest.metrics = Some(run_metrics);
        manifest.data_fingerprint = fingerprint;
        manifest.resource_usage = ResourceUsage::capture();
        manifest.shutdown_order = vec![
            "simulator".to_string(),
            "sinks".to_string(),
            "metrics".to_string(),
            "manifest".to_string(),
        ];
        manifest.ended_at = Some(Utc::now());

        let manifest_path = options
            .out_dir
            .join(format!("run_manifest_{}.json", self.run_id));
        manifest.write(&manifest_path)?;

        info!(
            run_id = %self.run_id,
            trades = trades.len(),
            signals = signal_count,
            "backtest complete"
        );
        Ok(BacktestReport {
            run_id: self.run_id.clone(),
            trades: trades.len(),
            signals: signal_count,
            manifest_path,
        })
    }

    fn build_policy(&self, options: &BacktestOptions) -> StrategyPolicy {
        let min_abs = self.config.signal.min_abs_score_for_side;
        if options.legacy_score_only {
            return StrategyPolicy::legacy(min_abs);
        }
        let gating_mode = if options.ignore_gating {
            GatingMode::IgnoreAll
        } else {
            options.gating_mode.unwrap_or({
                if self.config.backtest.ignore_gating_in_backtest {
                    GatingMode::IgnoreAll
                } else {
                    GatingMode::Strict
                }
            })
        };
        StrategyPolicy::new(gating_mode, options.quality_mode, min_abs)
    }

    fn run_mode_a(
        &self,
        options: &BacktestOptions,
        features_dir: &Path,
        simulator: &mut TradeSimulator,
        reemit_sink: &mut Option<JsonlSink>,
    ) -> Result<(ReaderStats, feeder::FeederStats, u64, DataFingerprint)> {
        let prefer_preview = self.config.input_mode == InputMode::Preview;
        let mut reader = DataReader::open(features_dir, prefer_preview)?
            .with_symbols(options.symbols.iter().cloned())
            .with_range(options.start_ms, options.end_ms);
        let rows = reader.read_features()?;
        if rows.is_empty() {
            bail!("no feature rows found under {}", features_dir.display());
        }

        let algo = CoreAlgorithm::new(
            self.config.signal.clone(),
            self.config.components.fusion.clone(),
            self.run_id.clone(),
            self.config_hash.clone(),
        );
        let mut feeder = ReplayFeeder::new(algo);

        let mut signal_count = 0u64;
        for row in rows {
            match feeder.feed_row(&row) {
                Some(signal) => {
                    signal_count += 1;
                    if let Some(sink) = reemit_sink.as_mut() {
                        sink.write(&signal)?;
                    }
                    simulator.on_signal(&signal);
                }
                None => {
                    // No signal this second: still a mark for exits.
                    simulator.on_mark(&row.symbol, row.ts_ms, row.mid);
                }
            }
        }

        let fingerprint = DataFingerprint::compute(features_dir)?;
        Ok((
            reader.stats().clone(),
            feeder.stats().clone(),
            signal_count,
            fingerprint,
        ))
    }

    fn run_mode_b(
        &self,
        options: &BacktestOptions,
        signals_src: &str,
        simulator: &mut TradeSimulator,
        reemit_sink: &mut Option<JsonlSink>,
    ) -> Result<(ReaderStats, feeder::FeederStats, u64, DataFingerprint)> {
        let (signals, reader_stats) = read_signals_src(
            signals_src,
            &options.symbols,
            options.start_ms,
            options.end_ms,
        )?;
        if signals.is_empty() {
            bail!("no signals found at {}", signals_src);
        }

        let mut signal_count = 0u64;
        for signal in &signals {
            signal_count += 1;
            if let Some(sink) = reemit_sink.as_mut() {
                sink.write(signal)?;
            }
            simulator.on_signal(signal);
        }

        // Dataset fingerprint covers filesystem sources; sqlite URIs
        // fingerprint the database file itself.
        let src_path = signals_src
            .strip_prefix("jsonl://")
            .or_else(|| signals_src.strip_prefix("sqlite://"))
            .unwrap_or(signals_src);
        let path = Path::new(src_path);
        let fingerprint = if path.is_dir() {
            DataFingerprint::compute(path)?
        } else {
            DataFingerprint {
                path: src_path.to_string(),
                files: vec![path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()],
                total_size: path.metadata().map(|m| m.len()).unwrap_or(0),
                file_count: 1,
                sha1_prefix: String::new(),
            }
        };
        Ok((
            reader_stats,
            feeder::FeederStats::default(),
            signal_count,
            fingerprint,
        ))
    }
}

/// Re-emit helper used by tests and the CLI summary.
pub fn count_jsonl_lines(path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Regime;
    use tempfile::tempdir;

    fn feature_line(ts_ms: Millis, score: f64) -> String {
        serde_json::to_string(&serde_json::json!({
            "symbol": "BTCUSDT",
            "second_ts": ts_ms / 1000,
            "ts_ms": ts_ms,
            "mid": 50_000.0 + (ts_ms % 7) as f64,
            "spread_bps": 5.0,
            "z_ofi": score,
            "z_cvd": score,
            "fusion_score": score,
            "consistency": 0.9,
            "lag_sec": 0.1,
            "regime": Regime::Active,
            "warmup": false,
            "kind": "features"
        }))
        .unwrap()
    }

    fn write_features(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        let mut lines = Vec::new();
        for i in 0..120i64 {
            // Alternate buy/sell stretches so trades open and close
            let score = if (i / 20) % 2 == 0 { 1.5 } else { -1.5 };
            lines.push(feature_line(1_731_456_000_000 + i * 1_000, score));
        }
        fs::write(dir.join("features.jsonl"), lines.join("\n") + "\n").unwrap();
    }

    fn options(mode: BacktestMode, root: &Path) -> BacktestOptions {
        BacktestOptions {
            mode,
            features_dir: Some(root.join("features")),
            signals_src: None,
            out_dir: root.join("out"),
            symbols: vec!["BTCUSDT".to_string()],
            start_ms: None,
            end_ms: None,
            gating_mode: Some(GatingMode::IgnoreSoft),
            quality_mode: QualityMode::All,
            reemit_signals: true,
            ignore_gating: false,
            legacy_score_only: false,
        }
    }

    #[test]
    fn test_mode_a_end_to_end() {
        let root = tempdir().unwrap();
        write_features(&root.path().join("features"));

        let mut config = Config::new_with_defaults();
        config.backtest.reverse_on_signal = true;
        config.backtest.min_hold_time_sec = Some(0.0);
        let runner = BacktestRunner::new(config, "bt_run_a");
        let report = runner.run(&options(BacktestMode::A, root.path())).unwrap();

        assert!(report.trades > 0, "expected trades from alternating stream");
        assert!(root.path().join("out/trades.jsonl").exists());
        assert!(root.path().join("out/ready/execlog/BTCUSDT").exists());
        assert!(root.path().join("out/metrics.json").exists());
        assert!(root.path().join("out/pnl_daily.jsonl").exists());
        assert!(report.manifest_path.exists());

        let manifest: RunManifest = serde_json::from_str(
            &fs::read_to_string(&report.manifest_path).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.run_id, "bt_run_a");
        assert!(manifest.ended_at.is_some());
        assert!(manifest.feeder_stats.rows_processed > 0);
        assert!(!manifest.data_fingerprint.sha1_prefix.is_empty());
    }

    #[test]
    fn test_idempotent_rerun_byte_identical() {
        let root = tempdir().unwrap();
        write_features(&root.path().join("features"));

        let run_once = |out: &str| {
            let mut config = Config::new_with_defaults();
            config.backtest.reverse_on_signal = true;
            config.backtest.min_hold_time_sec = Some(0.0);
            config.backtest.fee_model = crate::config::FeeModelKind::MakerTaker;
            let runner = BacktestRunner::new(config, "bt_idem");
            let mut opts = options(BacktestMode::A, root.path());
            opts.out_dir = root.path().join(out);
            opts.reemit_signals = false;
            runner.run(&opts).unwrap();
            (
                fs::read(root.path().join(out).join("trades.jsonl")).unwrap(),
                fs::read(root.path().join(out).join("metrics.json")).unwrap(),
            )
        };

        let (trades_a, metrics_a) = run_once("out_1");
        let (trades_b, metrics_b) = run_once("out_2");
        assert_eq!(trades_a, trades_b, "trades.jsonl must be byte-identical");
        assert_eq!(metrics_a, metrics_b, "metrics.json must be byte-identical");
    }

    #[test]
    fn test_mode_b_from_reemitted_signals() {
        let root = tempdir().unwrap();
        write_features(&root.path().join("features"));

        let mut config = Config::new_with_defaults();
        config.backtest.reverse_on_signal = true;
        config.backtest.min_hold_time_sec = Some(0.0);
        let runner = BacktestRunner::new(config.clone(), "bt_ab");
        let report_a = runner.run(&options(BacktestMode::A, root.path())).unwrap();
        assert!(report_a.signals > 0);

        // Mode B over the signals mode A re-emitted
        let runner_b = BacktestRunner::new(config, "bt_b");
        let mut opts_b = options(BacktestMode::B, root.path());
        opts_b.features_dir = None;
        opts_b.signals_src = Some(format!(
            "jsonl://{}",
            root.path().join("out/ready").display()
        ));
        opts_b.out_dir = root.path().join("out_b");
        opts_b.reemit_signals = false;
        let report_b = runner_b.run(&opts_b).unwrap();
        assert!(report_b.trades > 0);
        assert!(root.path().join("out_b/metrics.json").exists());
    }

    #[test]
    fn test_mode_validation_errors() {
        let root = tempdir().unwrap();
        let runner = BacktestRunner::new(Config::new_with_defaults(), "bt_err");

        let mut opts = options(BacktestMode::A, root.path());
        opts.features_dir = None;
        assert!(runner.run(&opts).is_err());

        let mut opts = options(BacktestMode::B, root.path());
        opts.signals_src = None;
        assert!(runner.run(&opts).is_err());
    }
}

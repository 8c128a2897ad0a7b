//! End-to-end integration: raw events through the live pipeline into the
//! dual sink, parity across the mirrors, then a mode-B backtest over the
//! SQLite mirror and a mode-A backtest over synthesized features.
//!
//! Everything runs in-process against a tempdir; no fixtures are required.

use alphaflow_backend::backtest::{BacktestMode, BacktestOptions, BacktestRunner};
use alphaflow_backend::config::{Config, SinkChoice};
use alphaflow_backend::engine::PipelineEngine;
use alphaflow_backend::sink::parity_report;
use alphaflow_backend::strategy::{GatingMode, QualityMode};
use std::fs;
use std::path::Path;

const BASE_TS: i64 = 1_731_492_000_000; // 2024-11-13T10:00:00Z

/// A raw event stream with alternating pressure so signals confirm and flip.
fn raw_event_lines() -> Vec<String> {
    let mut lines = Vec::new();
    for i in 0..600i64 {
        let ts = BASE_TS + i * 500;
        // Price trends up then down in 150-tick stretches
        let trend = if (i / 150) % 2 == 0 { 1.0 } else { -1.0 };
        let mid = 50_000.0 + trend * (i % 150) as f64;
        lines.push(format!(
            r#"{{"kind":"bookTicker","symbol":"BTCUSDT","ts_ms":{},"best_bid":{},"best_ask":{},"bid_size":{},"ask_size":{}}}"#,
            ts,
            mid - 0.5,
            mid + 0.5,
            10.0 + trend * (i % 50) as f64,
            10.0 - trend * (i % 50) as f64 * 0.1,
        ));
        let side = if trend > 0.0 { "buy" } else { "sell" };
        lines.push(format!(
            r#"{{"kind":"trade","symbol":"BTCUSDT","ts_ms":{},"price":{},"qty":1.5,"side":"{}"}}"#,
            ts + 100,
            mid,
            side
        ));
    }
    lines
}

fn feature_lines(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    let mut lines = Vec::new();
    for i in 0..240i64 {
        let score = if (i / 30) % 2 == 0 { 1.5 } else { -1.5 };
        lines.push(
            serde_json::json!({
                "symbol": "BTCUSDT",
                "second_ts": (BASE_TS + i * 1_000) / 1_000,
                "ts_ms": BASE_TS + i * 1_000,
                "mid": 50_000.0 + i as f64,
                "spread_bps": 5.0,
                "z_ofi": score,
                "z_cvd": score * 0.9,
                "fusion_score": score,
                "consistency": 0.9,
                "lag_sec": 0.1,
                "regime": "active",
                "warmup": false,
                "kind": "features"
            })
            .to_string(),
        );
    }
    fs::write(dir.join("features.jsonl"), lines.join("\n") + "\n").unwrap();
}

#[tokio::test]
async fn test_replay_dual_sink_parity_then_mode_b_backtest() {
    let root = tempfile::tempdir().unwrap();
    let pipeline_out = root.path().join("pipeline");

    let mut config = Config::new_with_defaults();
    config.sink = SinkChoice::Dual;
    config.replay_mode = true;

    let engine = PipelineEngine::new(config.clone(), "e2e_run");
    let report = engine
        .run(raw_event_lines(), &pipeline_out, None)
        .await
        .unwrap();
    assert!(report.stats.signals_written > 0, "pipeline produced no signals");

    // Both mirrors must agree exactly for an in-process run.
    let ready_root = pipeline_out.join("ready");
    let db_path = pipeline_out.join("signals_v2.db");
    assert!(db_path.exists());
    let parity = parity_report(&ready_root, &db_path, Some("e2e_run")).unwrap();
    assert_eq!(parity.jsonl_only, 0, "jsonl-only keys: {:?}", parity.top_minute_diffs);
    assert_eq!(parity.sqlite_only, 0);
    assert!(parity.within_tolerance());

    // Mode B backtest over the SQLite mirror.
    let mut bt_config = Config::new_with_defaults();
    bt_config.backtest.reverse_on_signal = true;
    bt_config.backtest.min_hold_time_sec = Some(0.0);
    let runner = BacktestRunner::new(bt_config, "e2e_bt");
    let options = BacktestOptions {
        mode: BacktestMode::B,
        features_dir: None,
        signals_src: Some(format!("sqlite://{}", db_path.display())),
        out_dir: root.path().join("bt_out"),
        symbols: vec!["BTCUSDT".to_string()],
        start_ms: None,
        end_ms: None,
        gating_mode: Some(GatingMode::IgnoreSoft),
        quality_mode: QualityMode::All,
        reemit_signals: false,
        ignore_gating: false,
        legacy_score_only: false,
    };
    let bt_report = runner.run(&options).unwrap();
    assert!(bt_report.signals > 0);
    assert!(root.path().join("bt_out/metrics.json").exists());
    assert!(root.path().join("bt_out/trades.jsonl").exists());
}

#[test]
fn test_mode_a_full_run_with_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let features_dir = root.path().join("features");
    feature_lines(&features_dir);

    let mut config = Config::new_with_defaults();
    config.backtest.reverse_on_signal = true;
    config.backtest.min_hold_time_sec = Some(0.0);
    config.backtest.take_profit_bps = Some(50.0);
    config.backtest.stop_loss_bps = Some(100.0);

    let runner = BacktestRunner::new(config, "e2e_mode_a");
    let options = BacktestOptions {
        mode: BacktestMode::A,
        features_dir: Some(features_dir),
        signals_src: None,
        out_dir: root.path().join("out"),
        symbols: vec![],
        start_ms: None,
        end_ms: None,
        gating_mode: Some(GatingMode::IgnoreSoft),
        quality_mode: QualityMode::All,
        reemit_signals: true,
        ignore_gating: false,
        legacy_score_only: false,
    };
    let report = runner.run(&options).unwrap();
    assert!(report.trades >= 2, "expected entries and exits, got {}", report.trades);

    // Trades parse and respect the pairing + pnl arithmetic invariants.
    let trades_text = fs::read_to_string(root.path().join("out/trades.jsonl")).unwrap();
    let mut open = 0i64;
    for line in trades_text.lines() {
        let trade: serde_json::Value = serde_json::from_str(line).unwrap();
        let reason = trade.get("reason").unwrap().as_str().unwrap();
        match reason {
            "entry" => open += 1,
            "reverse" => assert!(open > 0),
            _ => {
                open -= 1;
                assert!(open >= 0, "exit without entry");
                let gross = trade.get("gross_pnl").unwrap().as_f64().unwrap();
                let net = trade.get("net_pnl").unwrap().as_f64().unwrap();
                let entry_fee = trade.get("entry_fee").unwrap().as_f64().unwrap();
                let exit_fee = trade.get("exit_fee").unwrap().as_f64().unwrap();
                assert!((net - (gross - entry_fee - exit_fee)).abs() < 1e-6);
            }
        }
    }
    assert_eq!(open, 0, "positions left open after rollover close");

    // Metrics artifact carries the overall shape
    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.path().join("out/metrics.json")).unwrap())
            .unwrap();
    assert!(metrics.get("total_pnl").is_some());
    assert!(metrics.get("max_drawdown").is_some());
    assert!(metrics.get("per_scenario").is_some());

    // Re-emitted signals landed in the partitioned ready tree
    assert!(root.path().join("out/ready/signals/BTCUSDT").exists());
}

//! Pipeline Engine
//!
//! Wires ingestion to the sinks for a whole run: raw events fan out to one
//! worker per symbol, each worker owning its Aligner, FeaturePipe and
//! CoreAlgorithm (no cross-symbol shared mutable state), and all produced
//! signals funnel into a single dedicated sink writer task.
//!
//! ```text
//! events ──▶ router ──▶ per-symbol worker (Aligner → FeaturePipe → Core) ─┐
//!                 └──▶ per-symbol worker ...                              ├─▶ sink task
//!                                                                        ─┘
//! ```
//!
//! Shutdown is cooperative: when the input ends (or the caller cancels),
//! workers drain their in-flight rows, the sink flushes and closes, and the
//! run manifest is written last. The drain is capped by
//! `shutdown_grace_sec`; a forced stop still leaves every rotation atomic
//! and the manifest without `ended_at`.

use crate::aligner::Aligner;
use crate::backtest::manifest::{DataFingerprint, ResourceUsage, RunManifest};
use crate::config::Config;
use crate::core_algorithm::CoreAlgorithm;
use crate::events::MarketEvent;
use crate::features::FeaturePipe;
use crate::signal::SignalV2;
use crate::sink::make_sink;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const WORKER_CHANNEL_CAPACITY: usize = 1_024;
const SINK_CHANNEL_CAPACITY: usize = 4_096;

/// Engine counters for the manifest and the CLI summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub events_ingested: u64,
    pub events_malformed: u64,
    pub rows_aligned: u64,
    pub signals_emitted: u64,
    pub signals_written: u64,
    pub symbols: u64,
}

/// End-of-run summary.
#[derive(Debug)]
pub struct EngineReport {
    pub run_id: String,
    pub stats: EngineStats,
    pub manifest_path: PathBuf,
}

struct SymbolWorker {
    aligner: Aligner,
    features: FeaturePipe,
    algo: CoreAlgorithm,
    rows_aligned: u64,
    signals_emitted: u64,
}

impl SymbolWorker {
    fn new(symbol: &str, config: &Config, run_id: &str, config_hash: &str) -> Self {
        Self {
            aligner: Aligner::new(symbol, config.gap_threshold_sec),
            features: FeaturePipe::new(&config.components),
            algo: CoreAlgorithm::new(
                config.signal.clone(),
                config.components.fusion.clone(),
                run_id,
                config_hash,
            ),
            rows_aligned: 0,
            signals_emitted: 0,
        }
    }

    fn on_event(&mut self, event: &MarketEvent, out: &mut Vec<SignalV2>) {
        let closed = self.aligner.on_event(event);
        // Events update rolling state after the rows they close.
        for mut row in closed {
            self.features.annotate(&mut row);
            self.rows_aligned += 1;
            if let Some(signal) = self.algo.process(&row) {
                self.signals_emitted += 1;
                out.push(signal);
            }
        }
        self.features.on_event(event);
    }

    fn finish(&mut self, out: &mut Vec<SignalV2>) {
        if let Some(mut row) = self.aligner.finish() {
            self.features.annotate(&mut row);
            self.rows_aligned += 1;
            if let Some(signal) = self.algo.process(&row) {
                self.signals_emitted += 1;
                out.push(signal);
            }
        }
    }
}

/// Per-symbol worker pipeline over a raw event stream.
pub struct PipelineEngine {
    config: Config,
    run_id: String,
    config_hash: String,
}

impl PipelineEngine {
    pub fn new(config: Config, run_id: impl Into<String>) -> Self {
        let config_hash = config.config_hash();
        Self {
            config,
            run_id: run_id.into(),
            config_hash,
        }
    }

    /// Run the pipeline over raw event JSONL lines, writing signals through
    /// the configured sink under `out_dir`.
    pub async fn run<I>(&self, lines: I, out_dir: &Path, input_root: Option<&Path>) -> Result<EngineReport>
    where
        I: IntoIterator<Item = String>,
    {
        let started_at = Utc::now();
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;

        // Dedicated sink writer task.
        let (signal_tx, mut signal_rx) = mpsc::channel::<SignalV2>(SINK_CHANNEL_CAPACITY);
        let mut sink = make_sink(&self.config, out_dir)?;
        let sink_task: JoinHandle<Result<u64>> = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some(signal) = signal_rx.blocking_recv() {
                sink.write(&signal)?;
                written += 1;
            }
            sink.close()?;
            Ok(written)
        });

        // Per-symbol workers.
        let mut workers: HashMap<String, (mpsc::Sender<MarketEvent>, JoinHandle<(u64, u64)>)> =
            HashMap::new();
        let mut stats = EngineStats::default();

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(event) = MarketEvent::from_json_line(line) else {
                stats.events_malformed += 1;
                continue;
            };
            stats.events_ingested += 1;

            let symbol = event.symbol().to_string();
            if !workers.contains_key(&symbol) {
                let (tx, mut rx) = mpsc::channel::<MarketEvent>(WORKER_CHANNEL_CAPACITY);
                let mut worker =
                    SymbolWorker::new(&symbol, &self.config, &self.run_id, &self.config_hash);
                let signal_tx = signal_tx.clone();
                let handle = tokio::spawn(async move {
                    let mut produced = Vec::new();
                    while let Some(event) = rx.recv().await {
                        worker.on_event(&event, &mut produced);
                        for signal in produced.drain(..) {
                            if signal_tx.send(signal).await.is_err() {
                                warn!("sink channel closed while worker active");
                                return (worker.rows_aligned, worker.signals_emitted);
                            }
                        }
                    }
                    // Input drained: close the trailing second.
                    worker.finish(&mut produced);
                    for signal in produced.drain(..) {
                        let _ = signal_tx.send(signal).await;
                    }
                    (worker.rows_aligned, worker.signals_emitted)
                });
                workers.insert(symbol.clone(), (tx, handle));
            }
            if let Some((tx, _)) = workers.get(&symbol) {
                if tx.send(event).await.is_err() {
                    warn!(symbol = %symbol, "worker channel closed, dropping event");
                }
            }
        }

        // Cooperative drain: close worker inputs, then wait (bounded).
        stats.symbols = workers.len() as u64;
        let grace = Duration::from_secs(self.config.shutdown_grace_sec.max(1));
        let mut forced = false;
        for (symbol, (tx, handle)) in workers {
            drop(tx);
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok((rows, signals))) => {
                    stats.rows_aligned += rows;
                    stats.signals_emitted += signals;
                }
                Ok(Err(err)) => warn!(symbol = %symbol, error = %err, "worker panicked"),
                Err(_) => {
                    warn!(symbol = %symbol, "worker drain exceeded shutdown grace");
                    forced = true;
                }
            }
        }

        // All worker senders are gone; the sink drains and closes.
        drop(signal_tx);
        match tokio::time::timeout(grace, sink_task).await {
            Ok(Ok(Ok(written))) => stats.signals_written = written,
            Ok(Ok(Err(err))) => return Err(err.context("sink task failed")),
            Ok(Err(join_err)) => anyhow::bail!("sink task panicked: {}", join_err),
            Err(_) => {
                warn!("sink drain exceeded shutdown grace");
                forced = true;
            }
        }

        // Manifest last, after every sink flushed.
        let mut manifest = RunManifest::new(&self.run_id, &self.config_hash);
        manifest.started_at = Some(started_at);
        if !forced {
            manifest.ended_at = Some(Utc::now());
        }
        if let Some(root) = input_root {
            manifest.data_fingerprint = DataFingerprint::compute(root)?;
        }
        manifest.harvester_metrics = serde_json::to_value(&stats)?;
        manifest.resource_usage = ResourceUsage::capture();
        manifest.shutdown_order = vec![
            "workers".to_string(),
            "sink".to_string(),
            "manifest".to_string(),
        ];
        let manifest_path = out_dir.join(format!("run_manifest_{}.json", self.run_id));
        manifest.write(&manifest_path)?;

        info!(
            run_id = %self.run_id,
            events = stats.events_ingested,
            signals = stats.signals_written,
            forced,
            "pipeline run finished"
        );
        Ok(EngineReport {
            run_id: self.run_id.clone(),
            stats,
            manifest_path,
        })
    }
}

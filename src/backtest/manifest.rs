//! Run Manifest
//!
//! Auditable record of one run: configuration hash, git provenance, a SHA-1
//! fingerprint of the input dataset, component stats and the shutdown
//! order. Written to `run_manifest_{run_id}.json` when the run drains; a
//! forced shutdown may leave `ended_at` absent, which readers treat as an
//! incomplete run.

use crate::backtest::feeder::FeederStats;
use crate::backtest::metrics::RunMetrics;
use crate::backtest::reader::ReaderStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

/// SHA-1 fingerprint of the input dataset: relative paths and sizes of
/// every file under the root, hashed in sorted order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFingerprint {
    pub path: String,
    pub files: Vec<String>,
    pub total_size: u64,
    pub file_count: u64,
    pub sha1_prefix: String,
}

impl DataFingerprint {
    pub fn compute(root: &Path) -> Result<Self> {
        let mut entries: Vec<(String, u64)> = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(current) = stack.pop() {
            if !current.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&current)
                .with_context(|| format!("listing {}", current.display()))?
                .flatten()
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    let rel = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned();
                    entries.push((rel, size));
                }
            }
        }
        entries.sort();

        let mut hasher = Sha1::new();
        let mut total_size = 0u64;
        for (rel, size) in &entries {
            hasher.update(rel.as_bytes());
            hasher.update(b":");
            hasher.update(size.to_string().as_bytes());
            hasher.update(b";");
            total_size += size;
        }
        let digest = hex::encode(hasher.finalize());

        Ok(Self {
            path: root.to_string_lossy().into_owned(),
            file_count: entries.len() as u64,
            files: entries.into_iter().map(|(rel, _)| rel).collect(),
            total_size,
            sha1_prefix: digest[..12.min(digest.len())].to_string(),
        })
    }
}

/// Timeseries exporter counters (the exporter itself is an external
/// collaborator; counts stay zero unless it reports in).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeseriesExport {
    pub export_count: u64,
    pub error_count: u64,
}

/// Best-effort process resource usage snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_rss_kb: Option<u64>,
}

impl ResourceUsage {
    pub fn capture() -> Self {
        // VmHWM from /proc/self/status on Linux; None elsewhere.
        let peak_rss_kb = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| {
                status.lines().find_map(|line| {
                    line.strip_prefix("VmHWM:")?
                        .trim()
                        .split_whitespace()
                        .next()?
                        .parse()
                        .ok()
                })
            });
        Self { peak_rss_kb }
    }
}

/// The manifest written at end of run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    /// Absent when a forced shutdown preempted the drain.
    pub ended_at: Option<DateTime<Utc>>,
    pub config_hash: String,
    pub git_commit: Option<String>,
    pub data_fingerprint: DataFingerprint,
    pub reader_stats: ReaderStats,
    pub feeder_stats: FeederStats,
    pub metrics: Option<RunMetrics>,
    pub timeseries_export: TimeseriesExport,
    pub alerts: Vec<String>,
    pub harvester_metrics: serde_json::Value,
    pub resource_usage: ResourceUsage,
    pub shutdown_order: Vec<String>,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            config_hash: config_hash.into(),
            git_commit: std::env::var("GIT_COMMIT").ok(),
            harvester_metrics: serde_json::Value::Null,
            ..Default::default()
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

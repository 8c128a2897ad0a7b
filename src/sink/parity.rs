//! JSONL / SQLite Parity Reconciliation
//!
//! Diffs the two signal mirrors for a run: per-minute counts on both sides,
//! the reconciliation key set `(run_id, ts_ms, symbol, signal_type,
//! confirm)`, and the minutes where the relative count difference exceeds
//! the equivalence threshold. The report serializes to `parity_diff.json`.
//!
//! Equivalence contract: within any minute holding at least
//! `MIN_SIGNALS_PER_WINDOW` signals, `|jsonl - sqlite| / max <= 0.002`, and
//! the key sets agree to at least 99.8%.

use crate::models::MILLIS_PER_MINUTE;
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Relative count difference tolerated per minute window.
pub const COUNT_DIFF_THRESHOLD: f64 = 0.002;

/// Required key-set agreement ratio.
pub const KEY_AGREEMENT_THRESHOLD: f64 = 0.998;

/// Minutes below this population are reported but never flagged.
pub const MIN_SIGNALS_PER_WINDOW: u64 = 100;

/// Reconciliation key per signal.
pub type ParityKey = (String, i64, String, String, bool);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteWindow {
    /// Epoch minutes.
    pub minute: i64,
    pub jsonl_count: u64,
    pub sqlite_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteDiff {
    pub minute: i64,
    pub jsonl_count: u64,
    pub sqlite_count: u64,
    pub abs_diff: u64,
    pub rel_diff: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityReport {
    pub run_id: Option<String>,
    pub jsonl_count: u64,
    pub sqlite_count: u64,
    pub common_keys: u64,
    pub jsonl_only: u64,
    pub sqlite_only: u64,
    pub key_agreement_ratio: f64,
    pub window_alignment: Vec<MinuteWindow>,
    pub top_minute_diffs: Vec<MinuteDiff>,
    pub threshold_exceeded_minutes: Vec<i64>,
}

impl ParityReport {
    /// Does this run satisfy the dual-sink equivalence contract?
    pub fn within_tolerance(&self) -> bool {
        self.threshold_exceeded_minutes.is_empty()
            && self.key_agreement_ratio >= KEY_AGREEMENT_THRESHOLD
    }
}

fn key_from_value(value: &Value, run_id: Option<&str>) -> Option<ParityKey> {
    let obj = value.as_object()?;
    let row_run_id = obj.get("run_id").and_then(Value::as_str).unwrap_or("");
    if let Some(filter) = run_id {
        if row_run_id != filter {
            return None;
        }
    }
    let ts_ms = obj.get("ts_ms").and_then(Value::as_i64).unwrap_or(0);
    if ts_ms <= 0 {
        return None;
    }
    Some((
        row_run_id.to_string(),
        ts_ms,
        obj.get("symbol").and_then(Value::as_str).unwrap_or("").to_string(),
        obj.get("signal_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        obj.get("confirm").and_then(Value::as_bool).unwrap_or(false),
    ))
}

/// Collect reconciliation keys from every `*.jsonl` under a directory.
pub fn load_jsonl_keys(dir: &Path, run_id: Option<&str>) -> Result<BTreeSet<ParityKey>> {
    let mut keys = BTreeSet::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %current.display(), error = %err, "skipping unreadable dir");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "jsonl") {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => {
                            if let Some(key) = key_from_value(&value, run_id) {
                                keys.insert(key);
                            }
                        }
                        Err(_) => {
                            warn!(file = %path.display(), "skipping malformed jsonl line");
                        }
                    }
                }
            }
        }
    }
    Ok(keys)
}

/// Collect reconciliation keys from the SQLite mirror. Per-signal fields
/// beyond the key columns are read back out of the `meta` JSON.
pub fn load_sqlite_keys(db_path: &Path, run_id: Option<&str>) -> Result<BTreeSet<ParityKey>> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db {}", db_path.display()))?;
    let mut keys = BTreeSet::new();

    let mut stmt = conn.prepare("SELECT meta FROM signals")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for meta in rows {
        let meta = meta?;
        match serde_json::from_str::<Value>(&meta) {
            Ok(value) => {
                if let Some(key) = key_from_value(&value, run_id) {
                    keys.insert(key);
                }
            }
            Err(_) => warn!("skipping signal row with malformed meta JSON"),
        }
    }
    Ok(keys)
}

/// Build the full parity report for a run.
pub fn parity_report(
    jsonl_dir: &Path,
    sqlite_db: &Path,
    run_id: Option<&str>,
) -> Result<ParityReport> {
    let jsonl_keys = load_jsonl_keys(jsonl_dir, run_id)?;
    let sqlite_keys = load_sqlite_keys(sqlite_db, run_id)?;

    let common = jsonl_keys.intersection(&sqlite_keys).count() as u64;
    let jsonl_only = jsonl_keys.difference(&sqlite_keys).count() as u64;
    let sqlite_only = sqlite_keys.difference(&jsonl_keys).count() as u64;

    let union = jsonl_keys.len().max(sqlite_keys.len()) as u64;
    let key_agreement_ratio = if union == 0 {
        1.0
    } else {
        common as f64 / union as f64
    };

    // Per-minute counts on each side.
    let mut minutes: BTreeMap<i64, (u64, u64)> = BTreeMap::new();
    for key in &jsonl_keys {
        minutes.entry(key.1.div_euclid(MILLIS_PER_MINUTE)).or_default().0 += 1;
    }
    for key in &sqlite_keys {
        minutes.entry(key.1.div_euclid(MILLIS_PER_MINUTE)).or_default().1 += 1;
    }

    let window_alignment: Vec<MinuteWindow> = minutes
        .iter()
        .map(|(&minute, &(jsonl_count, sqlite_count))| MinuteWindow {
            minute,
            jsonl_count,
            sqlite_count,
        })
        .collect();

    let mut diffs: Vec<MinuteDiff> = window_alignment
        .iter()
        .filter(|w| w.jsonl_count != w.sqlite_count)
        .map(|w| {
            let max = w.jsonl_count.max(w.sqlite_count);
            MinuteDiff {
                minute: w.minute,
                jsonl_count: w.jsonl_count,
                sqlite_count: w.sqlite_count,
                abs_diff: w.jsonl_count.abs_diff(w.sqlite_count),
                rel_diff: if max == 0 {
                    0.0
                } else {
                    w.jsonl_count.abs_diff(w.sqlite_count) as f64 / max as f64
                },
            }
        })
        .collect();
    diffs.sort_by(|a, b| b.abs_diff.cmp(&a.abs_diff).then(a.minute.cmp(&b.minute)));

    let threshold_exceeded_minutes: Vec<i64> = diffs
        .iter()
        .filter(|d| {
            d.jsonl_count.max(d.sqlite_count) >= MIN_SIGNALS_PER_WINDOW
                && d.rel_diff > COUNT_DIFF_THRESHOLD
        })
        .map(|d| d.minute)
        .collect();

    diffs.truncate(10);

    Ok(ParityReport {
        run_id: run_id.map(str::to_string),
        jsonl_count: jsonl_keys.len() as u64,
        sqlite_count: sqlite_keys.len() as u64,
        common_keys: common,
        jsonl_only,
        sqlite_only,
        key_agreement_ratio,
        window_alignment,
        top_minute_diffs: diffs,
        threshold_exceeded_minutes,
    })
}

/// Serialize the report to `parity_diff.json` at `path`.
pub fn write_parity_report(report: &ParityReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

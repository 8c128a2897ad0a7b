//! Backtest Data Reader
//!
//! Enumerates recorded data for replay: a flat directory of JSONL files, a
//! `date=*/hour=*/symbol=*/kind=*` partition tree, or a `preview/` mirror.
//! Rows stream in `ts_ms` order via a k-way heap merge across partition
//! files; duplicates are dropped by `(symbol, ts_ms, kind)` keeping the
//! first occurrence, with ready sources taking priority over preview.
//!
//! Signal sources for mode B accept `jsonl://<dir>` and `sqlite://<db>`
//! URIs (a bare path is treated as JSONL).

use crate::models::{AlignedFeatureRow, Millis};
use crate::signal::SignalV2;
use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Detected layout of the input directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStructure {
    Flat,
    Partition,
    PreviewPartition,
}

impl SourceStructure {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStructure::Flat => "flat",
            SourceStructure::Partition => "partition",
            SourceStructure::PreviewPartition => "preview_partition",
        }
    }
}

/// Reader counters for the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderStats {
    pub files_scanned: u64,
    pub rows_read: u64,
    pub rows_deduped: u64,
    pub rows_malformed: u64,
    pub parquet_skipped: u64,
    pub structure: Option<String>,
}

struct SourceFile {
    path: PathBuf,
    /// Lower wins ties in the merge: ready=0, preview=1.
    priority: u8,
}

/// Streaming reader over recorded JSONL partitions.
pub struct DataReader {
    files: Vec<SourceFile>,
    structure: SourceStructure,
    symbols: Option<BTreeSet<String>>,
    start_ms: Option<Millis>,
    end_ms: Option<Millis>,
    stats: ReaderStats,
}

impl DataReader {
    /// Open a directory, auto-detecting flat vs partition layout. When the
    /// root holds a `preview/` partition mirror and `prefer_preview` is
    /// set, the mirror is read instead of the raw tree.
    pub fn open(root: &Path, prefer_preview: bool) -> Result<Self> {
        if !root.is_dir() {
            bail!("input directory does not exist: {}", root.display());
        }
        let preview_root = root.join("preview");
        let (structure, scan_root) = if prefer_preview && has_partitions(&preview_root) {
            (SourceStructure::PreviewPartition, preview_root)
        } else if has_partitions(root) {
            (SourceStructure::Partition, root.to_path_buf())
        } else if has_partitions(&preview_root) {
            (SourceStructure::PreviewPartition, preview_root)
        } else {
            (SourceStructure::Flat, root.to_path_buf())
        };

        let priority = match structure {
            SourceStructure::PreviewPartition => 1,
            _ => 0,
        };
        let mut files = Vec::new();
        collect_jsonl_files(&scan_root, priority, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut stats = ReaderStats::default();
        stats.structure = Some(structure.as_str().to_string());
        debug!(
            root = %root.display(),
            structure = structure.as_str(),
            files = files.len(),
            "data reader opened"
        );
        Ok(Self {
            files,
            structure,
            symbols: None,
            start_ms: None,
            end_ms: None,
            stats,
        })
    }

    pub fn with_symbols<I: IntoIterator<Item = String>>(mut self, symbols: I) -> Self {
        let set: BTreeSet<String> = symbols.into_iter().collect();
        self.symbols = (!set.is_empty()).then_some(set);
        self
    }

    /// Half-open time range `[start_ms, end_ms)`.
    pub fn with_range(mut self, start_ms: Option<Millis>, end_ms: Option<Millis>) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn structure(&self) -> SourceStructure {
        self.structure
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Read all rows merged in `ts_ms` order with dedup applied.
    pub fn read_rows(&mut self) -> Result<Vec<Value>> {
        // Load each file into a sorted run, then k-way merge by
        // (ts_ms, priority, file_idx, row_idx).
        let mut runs: Vec<Vec<(Millis, Value)>> = Vec::with_capacity(self.files.len());
        let mut priorities: Vec<u8> = Vec::with_capacity(self.files.len());
        for source in &self.files {
            if source.path.extension().is_some_and(|e| e == "parquet") {
                self.stats.parquet_skipped += 1;
                warn!(file = %source.path.display(), "parquet partition skipped (jsonl mirror expected)");
                continue;
            }
            self.stats.files_scanned += 1;
            let text = fs::read_to_string(&source.path)
                .with_context(|| format!("reading {}", source.path.display()))?;
            let mut run = Vec::new();
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(value) => value,
                    Err(_) => {
                        self.stats.rows_malformed += 1;
                        continue;
                    }
                };
                let Some(ts_ms) = value.get("ts_ms").and_then(Value::as_i64) else {
                    self.stats.rows_malformed += 1;
                    continue;
                };
                if !self.in_range(ts_ms) || !self.symbol_allowed(&value) {
                    continue;
                }
                run.push((ts_ms, value));
            }
            // Partition files are written in order; sort defensively anyway.
            run.sort_by_key(|(ts, _)| *ts);
            priorities.push(source.priority);
            runs.push(run);
        }

        // K-way heap merge.
        let mut heap: BinaryHeap<Reverse<(Millis, u8, usize, usize)>> = BinaryHeap::new();
        for (idx, run) in runs.iter().enumerate() {
            if let Some((ts, _)) = run.first() {
                heap.push(Reverse((*ts, priorities[idx], idx, 0)));
            }
        }

        let mut seen: HashSet<(String, Millis, String)> = HashSet::new();
        let mut out = Vec::new();
        while let Some(Reverse((ts, _, run_idx, row_idx))) = heap.pop() {
            let value = runs[run_idx][row_idx].1.clone();
            if let Some((next_ts, _)) = runs[run_idx].get(row_idx + 1) {
                heap.push(Reverse((*next_ts, priorities[run_idx], run_idx, row_idx + 1)));
            }

            self.stats.rows_read += 1;
            let key = dedup_key(&value, ts);
            if !seen.insert(key) {
                self.stats.rows_deduped += 1;
                continue;
            }
            out.push(value);
        }
        Ok(out)
    }

    /// Read rows as aligned feature rows (mode A input).
    pub fn read_features(&mut self) -> Result<Vec<AlignedFeatureRow>> {
        let mut rows = Vec::new();
        for value in self.read_rows()? {
            match serde_json::from_value::<AlignedFeatureRow>(value) {
                Ok(row) => rows.push(row),
                Err(_) => self.stats.rows_malformed += 1,
            }
        }
        Ok(rows)
    }

    fn in_range(&self, ts_ms: Millis) -> bool {
        self.start_ms.map_or(true, |start| ts_ms >= start)
            && self.end_ms.map_or(true, |end| ts_ms < end)
    }

    fn symbol_allowed(&self, value: &Value) -> bool {
        match (&self.symbols, value.get("symbol").and_then(Value::as_str)) {
            (Some(filter), Some(symbol)) => filter.contains(symbol),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

fn dedup_key(value: &Value, ts_ms: Millis) -> (String, Millis, String) {
    let symbol = value
        .get("symbol")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let kind = value
        .get("kind")
        .or_else(|| value.get("src"))
        .and_then(Value::as_str)
        .unwrap_or("row")
        .to_string();
    (symbol, ts_ms, kind)
}

fn has_partitions(root: &Path) -> bool {
    root.is_dir()
        && fs::read_dir(root).is_ok_and(|entries| {
            entries.flatten().any(|entry| {
                entry.file_name().to_string_lossy().starts_with("date=") && entry.path().is_dir()
            })
        })
}

fn collect_jsonl_files(root: &Path, priority: u8, out: &mut Vec<SourceFile>) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)
            .with_context(|| format!("listing {}", current.display()))?
            .flatten()
        {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .is_some_and(|e| e == "jsonl" || e == "parquet")
            {
                out.push(SourceFile { path, priority });
            }
        }
    }
    Ok(())
}

/// Load signals for mode B from a `jsonl://` directory or `sqlite://`
/// database (bare paths read as JSONL directories).
pub fn read_signals_src(
    src: &str,
    symbols: &[String],
    start_ms: Option<Millis>,
    end_ms: Option<Millis>,
) -> Result<(Vec<SignalV2>, ReaderStats)> {
    if let Some(db_path) = src.strip_prefix("sqlite://") {
        read_signals_sqlite(Path::new(db_path), symbols, start_ms, end_ms)
    } else {
        let dir = src.strip_prefix("jsonl://").unwrap_or(src);
        let mut reader = DataReader::open(Path::new(dir), false)?
            .with_symbols(symbols.iter().cloned())
            .with_range(start_ms, end_ms);
        let mut signals = Vec::new();
        for value in reader.read_rows()? {
            match serde_json::from_value::<SignalV2>(value) {
                Ok(signal) => signals.push(signal),
                Err(_) => reader.stats.rows_malformed += 1,
            }
        }
        let stats = reader.stats().clone();
        Ok((signals, stats))
    }
}

fn read_signals_sqlite(
    db_path: &Path,
    symbols: &[String],
    start_ms: Option<Millis>,
    end_ms: Option<Millis>,
) -> Result<(Vec<SignalV2>, ReaderStats)> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db {}", db_path.display()))?;
    let mut stats = ReaderStats {
        files_scanned: 1,
        structure: Some("sqlite".to_string()),
        ..Default::default()
    };

    let mut stmt = conn.prepare("SELECT meta FROM signals ORDER BY ts_ms, symbol")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let symbol_filter: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
    let mut signals = Vec::new();
    for meta in rows {
        let meta = meta?;
        stats.rows_read += 1;
        match serde_json::from_str::<SignalV2>(&meta) {
            Ok(signal) => {
                if !symbol_filter.is_empty() && !symbol_filter.contains(signal.symbol.as_str()) {
                    continue;
                }
                if start_ms.is_some_and(|s| signal.ts_ms < s)
                    || end_ms.is_some_and(|e| signal.ts_ms >= e)
                {
                    continue;
                }
                signals.push(signal);
            }
            Err(_) => stats.rows_malformed += 1,
        }
    }
    Ok((signals, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_jsonl(path: &Path, rows: &[Value]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = fs::File::create(path).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
    }

    fn feature_row(symbol: &str, ts_ms: Millis) -> Value {
        serde_json::json!({
            "symbol": symbol,
            "second_ts": ts_ms / 1000,
            "ts_ms": ts_ms,
            "mid": 100.0,
            "kind": "features"
        })
    }

    #[test]
    fn test_flat_structure_merge_order() {
        let dir = tempdir().unwrap();
        write_jsonl(
            &dir.path().join("a.jsonl"),
            &[feature_row("BTCUSDT", 3_000), feature_row("BTCUSDT", 1_000)],
        );
        write_jsonl(&dir.path().join("b.jsonl"), &[feature_row("BTCUSDT", 2_000)]);

        let mut reader = DataReader::open(dir.path(), false).unwrap();
        assert_eq!(reader.structure(), SourceStructure::Flat);
        let rows = reader.read_rows().unwrap();
        let ts: Vec<i64> = rows
            .iter()
            .map(|r| r.get("ts_ms").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(ts, vec![1_000, 2_000, 3_000]);
        assert_eq!(reader.stats().files_scanned, 2);
    }

    #[test]
    fn test_partition_structure_detected() {
        let dir = tempdir().unwrap();
        let partition = dir
            .path()
            .join("date=2024-11-13/hour=10/symbol=BTCUSDT/kind=features");
        write_jsonl(&partition.join("part-0.jsonl"), &[feature_row("BTCUSDT", 1_000)]);

        let mut reader = DataReader::open(dir.path(), false).unwrap();
        assert_eq!(reader.structure(), SourceStructure::Partition);
        assert_eq!(reader.read_rows().unwrap().len(), 1);
    }

    #[test]
    fn test_preview_fallback() {
        let dir = tempdir().unwrap();
        let preview = dir
            .path()
            .join("preview/date=2024-11-13/hour=10/symbol=BTCUSDT/kind=features");
        write_jsonl(&preview.join("part-0.jsonl"), &[feature_row("BTCUSDT", 1_000)]);

        let reader = DataReader::open(dir.path(), false).unwrap();
        assert_eq!(reader.structure(), SourceStructure::PreviewPartition);
    }

    #[test]
    fn test_dedup_keeps_first() {
        let dir = tempdir().unwrap();
        write_jsonl(
            &dir.path().join("a.jsonl"),
            &[feature_row("BTCUSDT", 1_000), feature_row("BTCUSDT", 1_000)],
        );
        write_jsonl(&dir.path().join("b.jsonl"), &[feature_row("BTCUSDT", 1_000)]);

        let mut reader = DataReader::open(dir.path(), false).unwrap();
        let rows = reader.read_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(reader.stats().rows_deduped, 2);
    }

    #[test]
    fn test_symbol_and_range_filters() {
        let dir = tempdir().unwrap();
        write_jsonl(
            &dir.path().join("a.jsonl"),
            &[
                feature_row("BTCUSDT", 1_000),
                feature_row("ETHUSDT", 2_000),
                feature_row("BTCUSDT", 3_000),
                feature_row("BTCUSDT", 9_000),
            ],
        );

        let mut reader = DataReader::open(dir.path(), false)
            .unwrap()
            .with_symbols(["BTCUSDT".to_string()])
            .with_range(Some(1_500), Some(9_000));
        let rows = reader.read_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ts_ms").unwrap().as_i64().unwrap(), 3_000);
    }

    #[test]
    fn test_malformed_lines_counted_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        fs::write(
            &path,
            "not json\n{\"symbol\":\"BTCUSDT\"}\n{\"symbol\":\"BTCUSDT\",\"ts_ms\":1000,\"kind\":\"features\"}\n",
        )
        .unwrap();

        let mut reader = DataReader::open(dir.path(), false).unwrap();
        let rows = reader.read_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(reader.stats().rows_malformed, 2);
    }

    #[test]
    fn test_read_signals_jsonl_src() {
        let dir = tempdir().unwrap();
        let signal = SignalV2 {
            run_id: "r1".into(),
            symbol: "BTCUSDT".into(),
            ts_ms: 5_000,
            signal_id: SignalV2::make_id("r1", "BTCUSDT", 5_000, 0),
            confirm: true,
            ..Default::default()
        };
        write_jsonl(
            &dir.path().join("signals.jsonl"),
            &[serde_json::to_value(&signal).unwrap()],
        );

        let src = format!("jsonl://{}", dir.path().display());
        let (signals, stats) = read_signals_src(&src, &[], None, None).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_id, signal.signal_id);
        assert_eq!(stats.rows_read, 1);
    }
}

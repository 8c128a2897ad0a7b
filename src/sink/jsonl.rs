//! Rotating Partitioned JSONL Sink
//!
//! Append-only writer partitioned as
//! `ready/{kind}/{symbol}/{YYYYMMDD}/{kind}-{YYYYMMDDTHH}.jsonl`.
//!
//! The active file carries a `.part.jsonl` suffix and is promoted to its
//! final name by an atomic rename on rotation, so readers only ever see
//! closed files and a crash never leaves a half-promoted file. Rotation
//! triggers on the hour boundary of the row stream, on `rotate.max_rows`,
//! and on `rotate.max_sec` of stream time. Every line is newline-terminated
//! canonical JSON; the file is fsynced every `fsync_every_n` rows.

use crate::config::RotateConfig;
use crate::models::Millis;
use crate::paths::{hour_stamp, DataKind};
use crate::signal::SignalV2;
use crate::sink::SignalSink;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

/// Counters exposed in the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonlSinkStats {
    pub rows_written: u64,
    pub rotations: u64,
    pub fsyncs: u64,
}

struct Writer {
    file: File,
    part_path: PathBuf,
    dir: PathBuf,
    stamp: String,
    first_ts_ms: Millis,
    rows: u64,
    rows_since_fsync: u64,
}

/// Partitioned JSONL writer for one data kind, keyed by symbol.
pub struct JsonlSink {
    ready_root: PathBuf,
    kind: DataKind,
    rotate: RotateConfig,
    fsync_every_n: u64,
    writers: HashMap<String, Writer>,
    stats: JsonlSinkStats,
}

impl JsonlSink {
    pub fn new(ready_root: PathBuf, rotate: RotateConfig, fsync_every_n: u64) -> Self {
        Self::for_kind(ready_root, DataKind::Signals, rotate, fsync_every_n)
    }

    pub fn for_kind(
        ready_root: PathBuf,
        kind: DataKind,
        rotate: RotateConfig,
        fsync_every_n: u64,
    ) -> Self {
        Self {
            ready_root,
            kind,
            rotate,
            fsync_every_n,
            writers: HashMap::new(),
            stats: JsonlSinkStats::default(),
        }
    }

    pub fn stats(&self) -> &JsonlSinkStats {
        &self.stats
    }

    /// Append one canonical line for `symbol` at stream time `ts_ms`.
    pub fn write_line(&mut self, symbol: &str, ts_ms: Millis, line: &str) -> Result<()> {
        let stamp = hour_stamp(ts_ms);
        let needs_rotation = self.writers.get(symbol).is_some_and(|w| {
            w.stamp != stamp
                || w.rows >= self.rotate.max_rows
                || (ts_ms - w.first_ts_ms) / 1_000 >= self.rotate.max_sec as i64
        });
        if needs_rotation {
            self.rotate_symbol(symbol)?;
        }

        if !self.writers.contains_key(symbol) {
            let writer = self.open_writer(symbol, ts_ms, &stamp)?;
            self.writers.insert(symbol.to_string(), writer);
        }
        let writer = self
            .writers
            .get_mut(symbol)
            .context("writer just inserted")?;

        writer.file.write_all(line.as_bytes())?;
        writer.file.write_all(b"\n")?;
        writer.rows += 1;
        writer.rows_since_fsync += 1;
        self.stats.rows_written += 1;

        if self.fsync_every_n > 0 && writer.rows_since_fsync >= self.fsync_every_n {
            writer.file.sync_data()?;
            writer.rows_since_fsync = 0;
            self.stats.fsyncs += 1;
        }
        Ok(())
    }

    fn open_writer(&self, symbol: &str, ts_ms: Millis, stamp: &str) -> Result<Writer> {
        let day = hour_stamp(ts_ms)[..8].to_string();
        let dir = self
            .ready_root
            .join(self.kind.as_str())
            .join(symbol)
            .join(day);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating partition dir {}", dir.display()))?;
        debug_assert_eq!(stamp, hour_stamp(ts_ms));
        let part_path = dir.join(crate::paths::ready_part_name(self.kind, ts_ms));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .with_context(|| format!("opening {}", part_path.display()))?;
        debug!(path = %part_path.display(), "opened partition file");
        Ok(Writer {
            file,
            part_path,
            dir,
            stamp: stamp.to_string(),
            first_ts_ms: ts_ms,
            rows: 0,
            rows_since_fsync: 0,
        })
    }

    /// Promote the symbol's active `.part` file to its final name.
    fn rotate_symbol(&mut self, symbol: &str) -> Result<()> {
        let Some(writer) = self.writers.remove(symbol) else {
            return Ok(());
        };
        writer.file.sync_data()?;
        drop(writer.file);

        // Row-count rotation can close several files within one hour; the
        // final name takes the first free sequence suffix.
        let base = format!("{}-{}", self.kind, writer.stamp);
        let mut target = writer.dir.join(format!("{}.jsonl", base));
        let mut seq = 1u32;
        while target.exists() {
            target = writer.dir.join(format!("{}.{}.jsonl", base, seq));
            seq += 1;
        }
        fs::rename(&writer.part_path, &target).with_context(|| {
            format!(
                "promoting {} -> {}",
                writer.part_path.display(),
                target.display()
            )
        })?;
        self.stats.rotations += 1;
        debug!(path = %target.display(), rows = writer.rows, "rotated partition");
        Ok(())
    }
}

impl SignalSink for JsonlSink {
    fn write(&mut self, signal: &SignalV2) -> Result<()> {
        let line = signal.to_jsonl_line()?;
        self.write_line(&signal.symbol, signal.ts_ms, &line)
    }

    fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.file.flush()?;
            writer.file.sync_data()?;
            writer.rows_since_fsync = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let symbols: Vec<String> = self.writers.keys().cloned().collect();
        for symbol in symbols {
            self.rotate_symbol(&symbol)?;
        }
        info!(
            rows = self.stats.rows_written,
            rotations = self.stats.rotations,
            "jsonl sink closed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        // Best effort on unexpected teardown; close() is the real path.
        let _ = self.flush();
    }
}

//! Batched SQLite Signal Mirror
//!
//! Mirrors the signal stream into a WAL-mode SQLite database with the
//! composite primary key `(run_id, ts_ms, symbol)`. Writes are batched:
//! a batch commits when it reaches `sqlite.batch_n` rows or when
//! `sqlite.flush_ms` has elapsed since the previous commit.
//!
//! A failed batch is retried with exponential backoff; after the retry
//! budget it is spilled to `failed_batches.jsonl` for replay and the sink is
//! marked degraded (the JSONL leg of a dual sink keeps going). `close()`
//! drains the batch and checkpoints the WAL.

use crate::config::SqliteConfig;
use crate::signal::SignalV2;
use crate::sink::SignalSink;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Database file name next to the `ready/` tree.
pub const SQLITE_DB_FILE: &str = "signals_v2.db";

/// Deadletter file for batches that exhausted the retry budget.
pub const DEADLETTER_FILE: &str = "failed_batches.jsonl";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 10;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS signals (
    run_id TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    signal_id TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    side_hint TEXT NOT NULL,
    score REAL NOT NULL,
    gating INTEGER NOT NULL,
    confirm INTEGER NOT NULL,
    cooldown_ms INTEGER NOT NULL,
    expiry_ms INTEGER NOT NULL,
    decision_code TEXT NOT NULL,
    decision_reason TEXT,
    config_hash TEXT NOT NULL,
    meta TEXT NOT NULL,
    PRIMARY KEY (run_id, ts_ms, symbol)
);

CREATE INDEX IF NOT EXISTS idx_signals_symbol_ts ON signals(symbol, ts_ms);
CREATE INDEX IF NOT EXISTS idx_signals_run_id ON signals(run_id);
"#;

/// Counters exposed in the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqliteSinkStats {
    pub rows_written: u64,
    pub batches_committed: u64,
    pub retries: u64,
    pub deadletter_rows: u64,
    pub degraded: bool,
}

/// Batched WAL-mode SQLite mirror. Single writer by contract.
pub struct SqliteSink {
    conn: Connection,
    config: SqliteConfig,
    deadletter_path: PathBuf,
    batch: Vec<SignalV2>,
    last_flush: Instant,
    stats: SqliteSinkStats,
}

impl SqliteSink {
    pub fn open(db_path: &Path, config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening sqlite db {}", db_path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying signals schema")?;
        let deadletter_path = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DEADLETTER_FILE);
        Ok(Self {
            conn,
            config,
            deadletter_path,
            batch: Vec::new(),
            last_flush: Instant::now(),
            stats: SqliteSinkStats::default(),
        })
    }

    pub fn stats(&self) -> &SqliteSinkStats {
        &self.stats
    }

    pub fn is_degraded(&self) -> bool {
        self.stats.degraded
    }

    fn commit_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            match Self::insert_rows(&mut self.conn, &self.batch) {
                Ok(()) => {
                    self.stats.rows_written += self.batch.len() as u64;
                    self.stats.batches_committed += 1;
                    self.batch.clear();
                    self.last_flush = Instant::now();
                    return Ok(());
                }
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    self.stats.retries += 1;
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << attempt);
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "sqlite batch failed, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    error!(
                        rows = self.batch.len(),
                        error = %err,
                        "sqlite batch exhausted retries, spilling to deadletter"
                    );
                    self.spill_deadletter()?;
                    self.stats.degraded = true;
                    self.last_flush = Instant::now();
                    return Ok(());
                }
            }
        }
    }

    fn insert_rows(conn: &mut Connection, rows: &[SignalV2]) -> Result<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO signals (
                    run_id, ts_ms, symbol, signal_id, schema_version, side_hint,
                    score, gating, confirm, cooldown_ms, expiry_ms,
                    decision_code, decision_reason, config_hash, meta
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for signal in rows {
                // The full canonical line rides in `meta`; parity and replay
                // tooling read per-signal fields back out of it.
                let meta = signal.to_jsonl_line()?;
                stmt.execute(params![
                    signal.run_id,
                    signal.ts_ms,
                    signal.symbol,
                    signal.signal_id,
                    signal.schema_version,
                    signal.side_hint.as_str(),
                    signal.score,
                    signal.gating.len() as i64,
                    signal.confirm as i64,
                    signal.cooldown_ms,
                    signal.expiry_ms,
                    signal.decision_code.as_str(),
                    signal.decision_reason,
                    signal.config_hash,
                    meta,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn spill_deadletter(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.deadletter_path)
            .with_context(|| format!("opening {}", self.deadletter_path.display()))?;
        for signal in &self.batch {
            let line = signal.to_jsonl_line()?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        self.stats.deadletter_rows += self.batch.len() as u64;
        self.batch.clear();
        Ok(())
    }
}

impl SignalSink for SqliteSink {
    fn write(&mut self, signal: &SignalV2) -> Result<()> {
        self.batch.push(signal.clone());
        let deadline_hit = self.last_flush.elapsed().as_millis() as i64 >= self.config.flush_ms;
        if self.batch.len() >= self.config.batch_n || deadline_hit {
            self.commit_batch()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.commit_batch()
    }

    fn close(&mut self) -> Result<()> {
        self.commit_batch()?;
        // Fold the WAL back into the main database file.
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .context("wal checkpoint on close")?;
        info!(
            rows = self.stats.rows_written,
            batches = self.stats.batches_committed,
            degraded = self.stats.degraded,
            "sqlite sink closed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Count signals for a run (reader-side helper for parity and tests).
pub fn count_signals(db_path: &Path, run_id: Option<&str>) -> Result<u64> {
    let conn = Connection::open(db_path)?;
    let count: i64 = match run_id {
        Some(run_id) => conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?,
    };
    Ok(count as u64)
}

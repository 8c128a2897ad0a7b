//! Signal Sinks
//!
//! Persistence fan-out for the signal stream: a rotating partitioned JSONL
//! writer, a batched SQLite mirror, and a dual sink that feeds both. Sinks
//! own their file handles and batch buffers and release them
//! deterministically in `close()`.

pub mod jsonl;
pub mod parity;
pub mod sqlite;

use crate::config::{Config, SinkChoice};
use crate::signal::SignalV2;
use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

pub use jsonl::{JsonlSink, JsonlSinkStats};
pub use parity::{parity_report, write_parity_report, ParityReport};
pub use sqlite::{SqliteSink, SqliteSinkStats, SQLITE_DB_FILE};

/// Common sink contract. `close` must drain everything buffered; partial
/// data left behind by a crash must still be structurally valid.
pub trait SignalSink: Send {
    fn write(&mut self, signal: &SignalV2) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Fan-out sink. A row counts as written when at least one leg accepted it;
/// legs that rejected the row are logged and counted.
pub struct MultiSink {
    sinks: Vec<Box<dyn SignalSink>>,
    rejected: Vec<u64>,
    written: u64,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn SignalSink>>) -> Self {
        let rejected = vec![0; sinks.len()];
        Self {
            sinks,
            rejected,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Rejection counts per leg, in construction order.
    pub fn rejections(&self) -> &[u64] {
        &self.rejected
    }
}

impl SignalSink for MultiSink {
    fn write(&mut self, signal: &SignalV2) -> Result<()> {
        let mut accepted = 0usize;
        let mut last_err = None;
        for (idx, sink) in self.sinks.iter_mut().enumerate() {
            match sink.write(signal) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    self.rejected[idx] += 1;
                    warn!(
                        sink = sink.name(),
                        signal_id = %signal.signal_id,
                        error = %err,
                        "sink leg rejected row"
                    );
                    last_err = Some(err);
                }
            }
        }
        if accepted > 0 {
            self.written += 1;
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no sink legs configured")))
        }
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.close() {
                warn!(sink = sink.name(), error = %err, "sink close failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "dual"
    }
}

/// Build the configured sink rooted at `output_dir` (the directory holding
/// `ready/` and the SQLite database).
pub fn make_sink(config: &Config, output_dir: &Path) -> Result<Box<dyn SignalSink>> {
    let ready_root = output_dir.join("ready");
    let db_path = output_dir.join(SQLITE_DB_FILE);

    let sink: Box<dyn SignalSink> = match config.sink {
        SinkChoice::Jsonl => Box::new(JsonlSink::new(
            ready_root,
            config.rotate.clone(),
            config.fsync_every_n,
        )),
        SinkChoice::Sqlite => Box::new(SqliteSink::open(&db_path, config.sqlite.clone())?),
        SinkChoice::Dual => {
            let jsonl = JsonlSink::new(ready_root, config.rotate.clone(), config.fsync_every_n);
            let sqlite = SqliteSink::open(&db_path, config.sqlite.clone())?;
            Box::new(MultiSink::new(vec![Box::new(jsonl), Box::new(sqlite)]))
        }
    };
    info!(sink = sink.name(), output_dir = %output_dir.display(), "sink ready");
    Ok(sink)
}

#[cfg(test)]
mod dual_tests;

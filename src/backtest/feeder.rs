//! Replay Feeder
//!
//! Drives CoreAlgorithm row-by-row over a recorded feature stream and
//! forwards produced signals to the caller (sink, simulator, or both).
//! CoreAlgorithm is already free of external time sources; replay mode is
//! just feeding it recorded rows in order.

use crate::core_algorithm::CoreAlgorithm;
use crate::models::AlignedFeatureRow;
use crate::signal::SignalV2;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Feeder counters for the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeederStats {
    pub rows_processed: u64,
    pub signals_emitted: u64,
    pub signals_suppressed: u64,
    pub signals_confirmed: u64,
}

/// Feeds aligned rows through CoreAlgorithm in replay mode.
pub struct ReplayFeeder {
    algo: CoreAlgorithm,
    stats: FeederStats,
}

impl ReplayFeeder {
    pub fn new(algo: CoreAlgorithm) -> Self {
        Self {
            algo,
            stats: FeederStats::default(),
        }
    }

    pub fn stats(&self) -> &FeederStats {
        &self.stats
    }

    /// Feed one row; returns the emitted signal, if any.
    pub fn feed_row(&mut self, row: &AlignedFeatureRow) -> Option<SignalV2> {
        self.stats.rows_processed += 1;
        match self.algo.process(row) {
            Some(signal) => {
                self.stats.signals_emitted += 1;
                if signal.confirm {
                    self.stats.signals_confirmed += 1;
                }
                Some(signal)
            }
            None => {
                self.stats.signals_suppressed += 1;
                None
            }
        }
    }

    /// Feed a whole stream, handing each signal to `on_signal`.
    pub fn feed<I, F>(&mut self, rows: I, mut on_signal: F) -> Result<()>
    where
        I: IntoIterator<Item = AlignedFeatureRow>,
        F: FnMut(SignalV2) -> Result<()>,
    {
        for row in rows {
            if let Some(signal) = self.feed_row(&row) {
                on_signal(signal)?;
            }
        }
        debug!(
            rows = self.stats.rows_processed,
            emitted = self.stats.signals_emitted,
            suppressed = self.stats.signals_suppressed,
            "replay feed complete"
        );
        Ok(())
    }
}

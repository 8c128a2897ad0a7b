//! Cumulative Volume Delta
//!
//! Running sum of signed trade volume (+qty for buy aggressor, -qty for
//! sell) plus a rolling window delta. Normalization is selectable: z-score
//! of the window delta against its own history (`delta`), or the window
//! delta scaled by the dispersion of the cumulative series (`cumulative`).

use crate::config::{CvdConfig, CvdZMode};
use crate::events::Aggressor;
use crate::features::rolling::{RollingSum, RollingStats};
use crate::models::Millis;

/// Per-symbol CVD state.
#[derive(Debug)]
pub struct CvdState {
    z_mode: CvdZMode,
    cumulative: f64,
    window: RollingSum,
    delta_stats: RollingStats,
    cumulative_stats: RollingStats,
    last_trade_ts: Option<Millis>,
}

impl CvdState {
    pub fn new(config: &CvdConfig) -> Self {
        // History windows for normalization span several delta windows so the
        // z-score has context beyond a single period.
        let history_ms = config.window_ms.saturating_mul(5);
        Self {
            z_mode: config.z_mode,
            cumulative: 0.0,
            window: RollingSum::new(config.window_ms),
            delta_stats: RollingStats::new(history_ms),
            cumulative_stats: RollingStats::new(history_ms),
            last_trade_ts: None,
        }
    }

    pub fn on_trade(&mut self, ts_ms: Millis, qty: f64, side: Aggressor) {
        let signed = side.sign() * qty;
        self.cumulative += signed;
        self.window.push(ts_ms, signed);
        self.last_trade_ts = Some(ts_ms);

        self.delta_stats.push(ts_ms, self.window.sum());
        self.cumulative_stats.push(ts_ms, self.cumulative);
    }

    /// Normalized CVD per the configured mode.
    pub fn z(&self) -> f64 {
        let delta = self.window.sum();
        match self.z_mode {
            CvdZMode::Delta => self.delta_stats.zscore(delta),
            CvdZMode::Cumulative => {
                let std = self.cumulative_stats.std();
                if std <= f64::EPSILON {
                    0.0
                } else {
                    delta / std
                }
            }
        }
    }

    #[inline]
    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    #[inline]
    pub fn window_delta(&self) -> f64 {
        self.window.sum()
    }

    /// Normalization samples accumulated so far (warmup gate input).
    #[inline]
    pub fn sample_count(&self) -> usize {
        self.delta_stats.len()
    }

    pub fn has_recent_trades(&self, now_ms: Millis, staleness_ms: i64) -> bool {
        self.last_trade_ts
            .is_some_and(|ts| now_ms - ts <= staleness_ms)
    }

    /// Evict stale window samples without a new trade (gap seconds).
    pub fn advance_to(&mut self, now_ms: Millis) {
        self.window.evict(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: CvdZMode) -> CvdConfig {
        CvdConfig {
            window_ms: 10_000,
            z_mode: mode,
        }
    }

    #[test]
    fn test_cumulative_tracks_signed_volume() {
        let mut cvd = CvdState::new(&config(CvdZMode::Delta));
        cvd.on_trade(0, 2.0, Aggressor::Buy);
        cvd.on_trade(100, 0.5, Aggressor::Sell);
        assert!((cvd.cumulative() - 1.5).abs() < 1e-12);
        assert!((cvd.window_delta() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_buy_pressure_positive_z() {
        let mut cvd = CvdState::new(&config(CvdZMode::Delta));
        // Balanced flow first, then a buy burst
        for i in 0..20 {
            let side = if i % 2 == 0 { Aggressor::Buy } else { Aggressor::Sell };
            cvd.on_trade(i * 500, 1.0, side);
        }
        for i in 20..26 {
            cvd.on_trade(i * 500, 3.0, Aggressor::Buy);
        }
        assert!(cvd.z() > 0.0, "z = {}", cvd.z());
    }

    #[test]
    fn test_cumulative_mode_scales_by_dispersion() {
        let mut cvd = CvdState::new(&config(CvdZMode::Cumulative));
        for i in 0..10 {
            cvd.on_trade(i * 500, 1.0, Aggressor::Buy);
        }
        // Steadily rising cumulative: positive delta over positive std
        assert!(cvd.z() > 0.0);
    }

    #[test]
    fn test_window_delta_eviction() {
        let mut cvd = CvdState::new(&config(CvdZMode::Delta));
        cvd.on_trade(0, 5.0, Aggressor::Buy);
        cvd.on_trade(20_000, 1.0, Aggressor::Sell);
        // First trade aged out of the 10s window; cumulative remembers it
        assert!((cvd.window_delta() - (-1.0)).abs() < 1e-12);
        assert!((cvd.cumulative() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_staleness() {
        let mut cvd = CvdState::new(&config(CvdZMode::Delta));
        assert!(!cvd.has_recent_trades(1_000, 500));
        cvd.on_trade(1_000, 1.0, Aggressor::Buy);
        assert!(cvd.has_recent_trades(1_200, 500));
        assert!(!cvd.has_recent_trades(5_000, 500));
    }
}

//! Feature Pipe
//!
//! Owns the per-symbol rolling micro-structure state and annotates each
//! aligned row with OFI, CVD, the fused score, consistency, regime, the 2x2
//! scenario bucket, divergence labels and quality tiers.
//!
//! Rows arrive from the aligner in second order per symbol; all mutation is
//! confined to the symbol's own state, so symbols may run on parallel
//! workers without sharing.
//!
//! Missing inputs degrade, never abort: without depth the OFI stops
//! updating (CVD still progresses), without trades the CVD stagnates; both
//! conditions are recorded as reason codes on the affected rows.

pub mod cvd;
pub mod ofi;
pub mod rolling;

use crate::config::{ComponentsConfig, FusionMethod};
use crate::events::{Level, MarketEvent};
use crate::models::{
    AlignedFeatureRow, DivType, QualityFlag, QualityTier, Regime, Scenario2x2, Secs,
};
use rolling::{RollingStats, RollingSum};
use std::collections::{HashMap, VecDeque};

/// Minimum normalization samples per component before rows stop being
/// warmup. Downstream treats warmup rows as non-confirmable.
pub const MIN_Z_SAMPLES: usize = 10;

const ZSUM_CLIP: f64 = 3.0;
const CONSISTENCY_EPS: f64 = 1e-9;

#[inline]
fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

struct SymbolState {
    ofi: ofi::OfiState,
    cvd: cvd::CvdState,
    /// Trade counts for regime labeling.
    regime_trades: RollingSum,
    /// Trade counts for the activity half of the scenario grid.
    scenario_trades: RollingSum,
    /// History of per-second activity samples, for the A/Q quantile.
    activity_history: RollingStats,
    price_history: VecDeque<(Secs, f64)>,
    score_history: VecDeque<(Secs, f64)>,
}

impl SymbolState {
    fn new(config: &ComponentsConfig) -> Self {
        Self {
            ofi: ofi::OfiState::new(&config.ofi, config.fusion.burst_coalesce_ms),
            cvd: cvd::CvdState::new(&config.cvd),
            regime_trades: RollingSum::new(config.regime.window_ms),
            scenario_trades: RollingSum::new(config.scenario.activity_window_ms),
            activity_history: RollingStats::new(config.scenario.activity_window_ms * 10),
            price_history: VecDeque::new(),
            score_history: VecDeque::new(),
        }
    }
}

/// Per-symbol feature computation over aligned rows.
pub struct FeaturePipe {
    config: ComponentsConfig,
    states: HashMap<String, SymbolState>,
}

impl FeaturePipe {
    pub fn new(config: &ComponentsConfig) -> Self {
        Self {
            config: config.clone(),
            states: HashMap::new(),
        }
    }

    fn state_mut(&mut self, symbol: &str) -> &mut SymbolState {
        let config = &self.config;
        self.states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(config))
    }

    /// Fold one raw event into the symbol's rolling state.
    pub fn on_event(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::Trade {
                symbol,
                ts_ms,
                qty,
                side,
                ..
            } => {
                let state = self.state_mut(symbol);
                state.cvd.on_trade(*ts_ms, *qty, *side);
                state.regime_trades.push(*ts_ms, 1.0);
                state.scenario_trades.push(*ts_ms, 1.0);
            }
            MarketEvent::Depth {
                symbol,
                ts_ms,
                bids,
                asks,
            } => {
                self.state_mut(symbol).ofi.on_depth(*ts_ms, bids, asks);
            }
            MarketEvent::BookTicker {
                symbol,
                ts_ms,
                best_bid,
                best_ask,
                bid_size,
                ask_size,
            } => {
                // Best-quote updates double as a one-level depth stream.
                let bids = [Level::new(*best_bid, *bid_size)];
                let asks = [Level::new(*best_ask, *ask_size)];
                self.state_mut(symbol).ofi.on_depth(*ts_ms, &bids, &asks);
            }
        }
    }

    /// Annotate a closed aligned row with micro features and quality labels.
    pub fn annotate(&mut self, row: &mut AlignedFeatureRow) {
        let fusion = self.config.fusion.clone();
        let quality = self.config.quality.clone();
        let regime_cfg = self.config.regime.clone();
        let scenario_cfg = self.config.scenario.clone();
        let lookback = self.config.divergence.lookback_bars.max(2);
        let ofi_window_ms = self.config.ofi.window_ms;
        let cvd_window_ms = self.config.cvd.window_ms;

        let symbol = row.symbol.clone();
        let state = self.state_mut(&symbol);
        state.ofi.advance_to(row.ts_ms);
        state.cvd.advance_to(row.ts_ms);
        state.regime_trades.evict(row.ts_ms);
        state.scenario_trades.evict(row.ts_ms);

        row.z_ofi = state.ofi.z();
        row.z_cvd = state.cvd.z();
        row.warmup =
            state.ofi.sample_count() < MIN_Z_SAMPLES || state.cvd.sample_count() < MIN_Z_SAMPLES;

        row.fusion_score = Some(fuse(&fusion.method, fusion.w_ofi, fusion.w_cvd, row.z_ofi, row.z_cvd));
        row.consistency = consistency(row.z_ofi, row.z_cvd);
        row.sign_agree = u8::from(sign(row.z_ofi) == sign(row.z_cvd));

        // Regime: trades per minute over the regime window.
        let tpm = state.regime_trades.sum() * (60_000.0 / regime_cfg.window_ms as f64);
        row.regime = if tpm >= regime_cfg.active_min_tpm {
            Regime::Active
        } else if tpm <= regime_cfg.quiet_max_tpm {
            Regime::Quiet
        } else {
            Regime::Base
        };

        // Scenario grid: activity quantile x spread band.
        let activity = state.scenario_trades.sum();
        state.activity_history.push(row.ts_ms, activity);
        row.scenario_2x2 = if row.mid <= 0.0 || state.activity_history.len() < MIN_Z_SAMPLES {
            Scenario2x2::Unknown
        } else {
            let active = activity >= state.activity_history.quantile(scenario_cfg.activity_quantile);
            let high_spread = row.spread_bps >= scenario_cfg.spread_high_bps;
            match (active, high_spread) {
                (true, true) => Scenario2x2::AH,
                (true, false) => Scenario2x2::AL,
                (false, true) => Scenario2x2::QH,
                (false, false) => Scenario2x2::QL,
            }
        };

        // Divergence: short-window slope of price vs fused score.
        if row.mid > 0.0 {
            push_capped(&mut state.price_history, (row.second_ts, row.mid), lookback);
        }
        push_capped(
            &mut state.score_history,
            (row.second_ts, row.fusion_score.unwrap_or(0.0)),
            lookback,
        );
        row.div_type = divergence(&state.price_history, &state.score_history, lookback);

        // Input staleness reason codes.
        if !state.ofi.has_recent_depth(row.ts_ms, ofi_window_ms) {
            row.reason_codes.insert("ofi_missing_depth".to_string());
        }
        if !state.cvd.has_recent_trades(row.ts_ms, cvd_window_ms) {
            row.reason_codes.insert("cvd_missing_trades".to_string());
        }

        // Quality flags and tier.
        if row.consistency < quality.low_consistency {
            push_flag(&mut row.quality_flags, QualityFlag::LowConsistency);
        }
        if row.effective_lag_sec() >= quality.lag_borderline_sec {
            push_flag(&mut row.quality_flags, QualityFlag::LagBorderline);
        }
        if row.spread_bps >= quality.spread_wide_bps {
            push_flag(&mut row.quality_flags, QualityFlag::SpreadWide);
        }
        row.quality_tier = if row.quality_flags.contains(&QualityFlag::LowConsistency)
            || row.quality_flags.len() >= 2
        {
            QualityTier::Weak
        } else if row.consistency >= quality.strong_consistency
            && row.sign_agree == 1
            && row.quality_flags.is_empty()
        {
            QualityTier::Strong
        } else {
            QualityTier::Normal
        };
    }
}

fn fuse(method: &FusionMethod, w_ofi: f64, w_cvd: f64, z_ofi: f64, z_cvd: f64) -> f64 {
    match method {
        FusionMethod::Weighted => w_ofi * z_ofi + w_cvd * z_cvd,
        FusionMethod::Zsum => {
            z_ofi.clamp(-ZSUM_CLIP, ZSUM_CLIP) + z_cvd.clamp(-ZSUM_CLIP, ZSUM_CLIP)
        }
    }
}

fn consistency(z_ofi: f64, z_cvd: f64) -> f64 {
    1.0 - (z_ofi - z_cvd).abs() / (z_ofi.abs() + z_cvd.abs() + CONSISTENCY_EPS)
}

fn push_capped(history: &mut VecDeque<(Secs, f64)>, sample: (Secs, f64), cap: usize) {
    history.push_back(sample);
    while history.len() > cap {
        history.pop_front();
    }
}

fn push_flag(flags: &mut Vec<QualityFlag>, flag: QualityFlag) {
    if !flags.contains(&flag) {
        flags.push(flag);
    }
}

fn divergence(
    prices: &VecDeque<(Secs, f64)>,
    scores: &VecDeque<(Secs, f64)>,
    lookback: usize,
) -> Option<DivType> {
    if prices.len() < lookback || scores.len() < lookback {
        return None;
    }
    let price_slope = prices.back()?.1 - prices.front()?.1;
    let score_slope = scores.back()?.1 - scores.front()?.1;
    if price_slope < 0.0 && score_slope > 0.0 {
        Some(DivType::BullDiv)
    } else if price_slope > 0.0 && score_slope < 0.0 {
        Some(DivType::BearDiv)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Aggressor;
    use crate::models::Millis;

    const BASE: Millis = 1_731_470_000_000;

    fn pipe() -> FeaturePipe {
        FeaturePipe::new(&ComponentsConfig::default())
    }

    fn row_at(second_offset: i64) -> AlignedFeatureRow {
        AlignedFeatureRow {
            symbol: "BTCUSDT".into(),
            second_ts: BASE / 1000 + second_offset,
            ts_ms: BASE + second_offset * 1000 + 999,
            mid: 100.0,
            best_bid: 99.99,
            best_ask: 100.01,
            spread_bps: 2.0,
            lag_sec: 0.1,
            ..Default::default()
        }
    }

    fn trade(ts_ms: Millis, qty: f64, side: Aggressor) -> MarketEvent {
        MarketEvent::Trade {
            symbol: "BTCUSDT".into(),
            ts_ms,
            price: 100.0,
            qty,
            side,
        }
    }

    fn depth(ts_ms: Millis, bid_size: f64, ask_size: f64) -> MarketEvent {
        MarketEvent::Depth {
            symbol: "BTCUSDT".into(),
            ts_ms,
            bids: vec![Level::new(99.99, bid_size)],
            asks: vec![Level::new(100.01, ask_size)],
        }
    }

    #[test]
    fn test_first_rows_are_warmup() {
        let mut pipe = pipe();
        pipe.on_event(&trade(BASE, 1.0, Aggressor::Buy));
        pipe.on_event(&depth(BASE, 10.0, 10.0));
        let mut row = row_at(0);
        pipe.annotate(&mut row);
        assert!(row.warmup);
        assert!(row.fusion_score.is_some());
    }

    #[test]
    fn test_warmup_clears_after_enough_samples() {
        let mut pipe = pipe();
        for i in 0..(MIN_Z_SAMPLES as i64 + 2) {
            pipe.on_event(&trade(BASE + i * 1000, 1.0, Aggressor::Buy));
            pipe.on_event(&depth(BASE + i * 1000, 10.0 + i as f64, 10.0));
        }
        let mut row = row_at(MIN_Z_SAMPLES as i64 + 2);
        pipe.annotate(&mut row);
        assert!(!row.warmup);
    }

    #[test]
    fn test_consistency_bounds() {
        assert!((consistency(1.0, 1.0) - 1.0).abs() < 1e-6);
        assert!(consistency(1.0, -1.0) < 0.01);
        // Both flat: no disagreement
        assert!(consistency(0.0, 0.0) > 0.999);
    }

    #[test]
    fn test_fusion_methods() {
        assert!((fuse(&FusionMethod::Weighted, 0.6, 0.4, 1.5, 1.2) - 1.38).abs() < 1e-12);
        // Clipped at +-3
        assert!((fuse(&FusionMethod::Zsum, 0.6, 0.4, 5.0, -1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_trades_reason_code() {
        let mut pipe = pipe();
        pipe.on_event(&depth(BASE, 10.0, 10.0));
        let mut row = row_at(0);
        pipe.annotate(&mut row);
        assert!(row.reason_codes.contains("cvd_missing_trades"));
        assert!(!row.reason_codes.contains("ofi_missing_depth"));
    }

    #[test]
    fn test_sign_agreement() {
        let mut pipe = pipe();
        // Sustained buy pressure on both inputs
        for i in 0..30 {
            pipe.on_event(&trade(BASE + i * 500, 2.0, Aggressor::Buy));
            pipe.on_event(&depth(BASE + i * 500, 10.0 + i as f64, 10.0));
        }
        let mut row = row_at(15);
        pipe.annotate(&mut row);
        assert_eq!(row.sign_agree, 1);
        assert!(row.fusion_score.unwrap_or(0.0) > 0.0);
    }

    #[test]
    fn test_quality_tier_degrades_on_flags() {
        let mut pipe = pipe();
        pipe.on_event(&trade(BASE, 1.0, Aggressor::Buy));
        let mut row = row_at(0);
        row.lag_sec = 5.0; // borderline lag
        row.spread_bps = 50.0; // wide spread
        pipe.annotate(&mut row);
        assert!(row.quality_flags.contains(&QualityFlag::LagBorderline));
        assert!(row.quality_flags.contains(&QualityFlag::SpreadWide));
        assert_eq!(row.quality_tier, QualityTier::Weak);
    }

    #[test]
    fn test_divergence_labels() {
        let mut prices = VecDeque::new();
        let mut scores = VecDeque::new();
        for i in 0..5 {
            prices.push_back((i, 100.0 - i as f64)); // falling price
            scores.push_back((i, i as f64 * 0.5)); // rising score
        }
        assert_eq!(divergence(&prices, &scores, 5), Some(DivType::BullDiv));

        let rising: VecDeque<_> = (0..5).map(|i| (i, 100.0 + i as f64)).collect();
        let falling: VecDeque<_> = (0..5).map(|i| (i, -(i as f64))).collect();
        assert_eq!(divergence(&rising, &falling, 5), Some(DivType::BearDiv));
        assert_eq!(divergence(&rising, &rising, 5), None);
    }

    #[test]
    fn test_scenario_unknown_without_history() {
        let mut pipe = pipe();
        pipe.on_event(&trade(BASE, 1.0, Aggressor::Buy));
        let mut row = row_at(0);
        pipe.annotate(&mut row);
        assert_eq!(row.scenario_2x2, Scenario2x2::Unknown);
    }
}

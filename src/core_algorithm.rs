//! CoreAlgorithm - Gating & Confirm State Machine
//!
//! Turns aligned feature rows into typed signals. Each row passes through a
//! fixed guard pipeline:
//!
//! 1. warmup short-circuit (pending signal)
//! 2. no-price / spread / lag hard guards
//! 3. weak-signal / low-consistency soft guards
//! 4. threshold classification per regime
//! 5. dedup window per (symbol, signal_type)
//! 6. consecutive-confirmation streak
//! 7. adaptive cooldown on direction change
//! 8. confirm + cooldown deadline update
//!
//! Soft guards do not block `confirm`; the strategy policy decides whether
//! to honor them. Hard guards and the structural reasons (warmup, dedup,
//! streak, cooldown) always leave the signal unconfirmed.
//!
//! # Determinism
//!
//! Output depends only on the input rows and the config: no wall clock, no
//! RNG, no iteration-order dependence. Per-symbol decision state is reset
//! when the run id changes.

use crate::config::{FusionConfig, SignalConfig};
use crate::models::{AlignedFeatureRow, Millis, SideHint, SignalType};
use crate::signal::{guard, DecisionCode, SignalV2, SCHEMA_VERSION};
use std::collections::HashMap;
use tracing::trace;

/// Per-symbol decision state.
#[derive(Debug, Default)]
struct DecisionState {
    /// Last confirmed emission per signal type (dedup window input).
    last_confirmed: HashMap<SignalType, Millis>,
    /// Direction of the last classified row (+1/-1/0).
    last_dir: i8,
    /// Consecutive same-direction rows ending at the current row.
    dir_streak: u32,
    /// Direction of the last confirmed signal.
    last_confirmed_dir: i8,
    /// Cooldown deadline set by the last confirmation.
    cooldown_deadline: Millis,
}

/// The gating & confirm state machine.
pub struct CoreAlgorithm {
    signal_config: SignalConfig,
    fusion_config: FusionConfig,
    run_id: String,
    config_hash: String,
    states: HashMap<String, DecisionState>,
    seq: u64,
}

impl CoreAlgorithm {
    pub fn new(
        signal_config: SignalConfig,
        fusion_config: FusionConfig,
        run_id: impl Into<String>,
        config_hash: impl Into<String>,
    ) -> Self {
        Self {
            signal_config,
            fusion_config,
            run_id: run_id.into(),
            config_hash: config_hash.into(),
            states: HashMap::new(),
            seq: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Switch to a new run id, resetting all per-symbol decision state.
    pub fn set_run_id(&mut self, run_id: impl Into<String>) {
        let run_id = run_id.into();
        if run_id != self.run_id {
            self.run_id = run_id;
            self.states.clear();
            self.seq = 0;
        }
    }

    /// Process one aligned row; emits zero or one signal.
    pub fn process(&mut self, row: &AlignedFeatureRow) -> Option<SignalV2> {
        let score = self.resolve_score(row);

        // Warmup rows short-circuit into a pending signal.
        if row.warmup {
            let mut signal = self.base_signal(row, score, SignalType::Pending);
            signal.gating.push(guard::WARMUP.to_string());
            signal.decision_code = DecisionCode::Pending;
            signal.decision_reason = Some(guard::WARMUP.to_string());
            return Some(self.finalize(signal));
        }

        let mut gating: Vec<String> = Vec::new();
        if row.mid <= 0.0 {
            gating.push(guard::NO_PRICE.to_string());
        }
        if row.spread_bps > self.signal_config.spread_bps_cap {
            gating.push(guard::SPREAD_BPS_EXCEEDED.to_string());
        }
        if row.effective_lag_sec() > self.signal_config.lag_cap_sec {
            gating.push(guard::LAG_SEC_EXCEEDED.to_string());
        }
        if score.abs() < self.signal_config.weak_signal_threshold {
            gating.push(guard::WEAK_SIGNAL.to_string());
        }
        if row.consistency < self.signal_config.consistency_min {
            gating.push(guard::LOW_CONSISTENCY.to_string());
        }

        let thresholds = self.signal_config.thresholds_for(row.regime.as_str());
        let signal_type = if score >= thresholds.strong_buy {
            SignalType::StrongBuy
        } else if score >= thresholds.buy {
            SignalType::Buy
        } else if score <= thresholds.strong_sell {
            SignalType::StrongSell
        } else if score <= thresholds.sell {
            SignalType::Sell
        } else {
            SignalType::Neutral
        };
        let direction = signal_type.direction();

        // Streak bookkeeping happens on every classified row.
        let dedupe_ms = self.signal_config.dedupe_ms;
        let min_streak = self.signal_config.min_consecutive_same_dir;
        let cooldown_ms =
            (self.signal_config.adaptive_cooldown_k * self.signal_config.base_cooldown_ms as f64) as i64;

        let state = self.states.entry(row.symbol.clone()).or_default();
        if direction != 0 && direction == state.last_dir {
            state.dir_streak += 1;
        } else if direction != 0 {
            state.dir_streak = 1;
        } else {
            state.dir_streak = 0;
        }
        state.last_dir = direction;

        let mut decision_code = DecisionCode::Ok;

        // Dedup window against the last confirmed emission of this type.
        if direction != 0 {
            if let Some(&last_ts) = state.last_confirmed.get(&signal_type) {
                if row.ts_ms - last_ts < dedupe_ms {
                    gating.push(guard::DUPLICATE_WITHIN_WINDOW.to_string());
                    decision_code = DecisionCode::Duplicate;
                }
            }
        }

        // Consecutive confirmation.
        if direction != 0
            && decision_code == DecisionCode::Ok
            && state.dir_streak < min_streak
        {
            gating.push(guard::REVERSE_COOLDOWN_INSUFFICIENT_TICKS.to_string());
            decision_code = DecisionCode::Unconfirmed;
        }

        // Adaptive cooldown blocks direction changes until the deadline.
        if direction != 0
            && decision_code == DecisionCode::Ok
            && row.ts_ms < state.cooldown_deadline
            && direction != state.last_confirmed_dir
        {
            gating.push(guard::ADAPTIVE_COOLDOWN.to_string());
            decision_code = DecisionCode::Cooldown;
        }

        // Nothing to report for a clean neutral row.
        if signal_type == SignalType::Neutral && gating.is_empty() {
            return None;
        }

        // Soft guards do not block confirmation; hard and structural ones do.
        let confirm = gating.iter().all(|g| crate::signal::is_soft_guard(g));

        if confirm && direction != 0 {
            state.last_confirmed.insert(signal_type, row.ts_ms);
            state.last_confirmed_dir = direction;
            state.cooldown_deadline = row.ts_ms + cooldown_ms;
        }

        let mut signal = self.base_signal(row, score, signal_type);
        signal.side_hint = SideHint::from_direction(direction);
        signal.confirm = confirm;
        signal.guard_reason = gating
            .iter()
            .find(|g| crate::signal::is_hard_guard(g))
            .cloned();
        signal.decision_code = if confirm && gating.is_empty() {
            DecisionCode::Ok
        } else if confirm {
            // Confirmed through soft guards only.
            DecisionCode::Gated
        } else if decision_code == DecisionCode::Ok {
            DecisionCode::Gated
        } else {
            decision_code
        };
        if !gating.is_empty() {
            signal.decision_reason = Some(gating.join(","));
        }
        signal.gating = gating;
        signal.cooldown_ms = cooldown_ms;

        trace!(
            symbol = %signal.symbol,
            ts_ms = signal.ts_ms,
            signal_type = signal.signal_type.as_str(),
            confirm = signal.confirm,
            gating = ?signal.gating,
            "signal decision"
        );
        Some(self.finalize(signal))
    }

    fn resolve_score(&self, row: &AlignedFeatureRow) -> f64 {
        match row.fusion_score {
            Some(score) if !self.signal_config.recompute_fusion => score,
            _ => self.fusion_config.w_ofi * row.z_ofi + self.fusion_config.w_cvd * row.z_cvd,
        }
    }

    fn base_signal(&self, row: &AlignedFeatureRow, score: f64, signal_type: SignalType) -> SignalV2 {
        let mut signal = SignalV2 {
            run_id: self.run_id.clone(),
            symbol: row.symbol.clone(),
            ts_ms: row.ts_ms,
            schema_version: SCHEMA_VERSION.to_string(),
            score,
            signal_type,
            regime: row.regime,
            consistency: row.consistency,
            z_ofi: row.z_ofi,
            z_cvd: row.z_cvd,
            spread_bps: row.spread_bps,
            lag_sec: row.effective_lag_sec(),
            mid_px: row.mid,
            expiry_ms: self.signal_config.expiry_ms,
            quality_tier: row.quality_tier,
            quality_flags: row.quality_flags.clone(),
            config_hash: self.config_hash.clone(),
            ..Default::default()
        };
        signal.meta.insert(
            "scenario_2x2".to_string(),
            serde_json::Value::String(row.scenario_2x2.as_str().to_string()),
        );
        if let Some(div) = row.div_type {
            signal.meta.insert(
                "div_type".to_string(),
                serde_json::Value::String(div.as_str().to_string()),
            );
        }
        signal
    }

    fn finalize(&mut self, mut signal: SignalV2) -> SignalV2 {
        signal.signal_id = SignalV2::make_id(&self.run_id, &signal.symbol, signal.ts_ms, self.seq);
        self.seq += 1;
        signal
    }
}

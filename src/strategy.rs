//! Strategy Policy Layer
//!
//! Pure decision logic shared by the backtest executor and any live
//! executor: whether a signal is tradeable under a gating mode, and which
//! side to take. Keeping this a pure function of the signal prevents
//! behavior drift between environments.

use crate::models::{QualityFlag, QualityTier, SideHint, SignalType};
use crate::signal::{is_hard_guard, is_soft_guard, SignalV2};
use serde::{Deserialize, Serialize};

/// How gating reasons are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    /// Production mode: any gating reason blocks.
    #[default]
    Strict,
    /// Soft guards are ignored; hard and structural reasons still block.
    IgnoreSoft,
    /// All reasons ignored except hard guards; confirm still required.
    IgnoreAll,
}

impl GatingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(GatingMode::Strict),
            "ignore_soft" => Some(GatingMode::IgnoreSoft),
            "ignore_all" => Some(GatingMode::IgnoreAll),
            _ => None,
        }
    }
}

/// Quality-tier filter applied after gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    Conservative,
    Balanced,
    Aggressive,
    #[default]
    All,
}

/// Order side decided from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Is this signal tradeable under the given gating mode?
///
/// Hard guards always block, even in the ignore modes. Soft guards are
/// dropped from view by `ignore_soft`; `ignore_all` clears everything but
/// hard guards. Whatever remains blocks, and an unconfirmed signal never
/// trades.
pub fn is_tradeable(signal: &SignalV2, mode: GatingMode) -> (bool, Option<String>) {
    let hard: Vec<&str> = signal
        .gating
        .iter()
        .filter(|g| is_hard_guard(g))
        .map(String::as_str)
        .collect();
    if !hard.is_empty() {
        return (false, Some(format!("gating_hard_{}", hard.join(","))));
    }

    let remaining: Vec<&str> = match mode {
        GatingMode::Strict => signal.gating.iter().map(String::as_str).collect(),
        GatingMode::IgnoreSoft => signal
            .gating
            .iter()
            .filter(|g| !is_soft_guard(g))
            .map(String::as_str)
            .collect(),
        GatingMode::IgnoreAll => Vec::new(),
    };
    if !remaining.is_empty() {
        return (false, Some(format!("gating_{}", remaining.join(","))));
    }

    if !signal.confirm {
        return (false, Some("confirm_false".to_string()));
    }

    (true, None)
}

/// Unified strategy decision logic.
///
/// The legacy flag replicates the historical backtest behavior of deciding
/// purely on score magnitude, bypassing confirm and gating entirely; it
/// exists only for regression comparisons.
#[derive(Debug, Clone)]
pub struct StrategyPolicy {
    pub gating_mode: GatingMode,
    pub quality_mode: QualityMode,
    pub legacy_backtest_mode: bool,
    pub min_abs_score_for_side: f64,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            gating_mode: GatingMode::Strict,
            quality_mode: QualityMode::All,
            legacy_backtest_mode: false,
            min_abs_score_for_side: 0.1,
        }
    }
}

impl StrategyPolicy {
    pub fn new(gating_mode: GatingMode, quality_mode: QualityMode, min_abs_score_for_side: f64) -> Self {
        Self {
            gating_mode,
            quality_mode,
            legacy_backtest_mode: false,
            min_abs_score_for_side,
        }
    }

    pub fn legacy(min_abs_score_for_side: f64) -> Self {
        Self {
            legacy_backtest_mode: true,
            min_abs_score_for_side,
            ..Self::default()
        }
    }

    /// Decide the trade side, in priority order: `signal_type`, then
    /// `side_hint`, then the score sign when its magnitude clears
    /// `min_abs_score_for_side`.
    pub fn decide_side(&self, signal: &SignalV2) -> Option<OrderSide> {
        match signal.signal_type {
            SignalType::Buy | SignalType::StrongBuy => return Some(OrderSide::Buy),
            SignalType::Sell | SignalType::StrongSell => return Some(OrderSide::Sell),
            SignalType::Neutral | SignalType::Pending => {}
        }
        match signal.side_hint {
            SideHint::Buy => return Some(OrderSide::Buy),
            SideHint::Sell => return Some(OrderSide::Sell),
            SideHint::None => {}
        }
        if signal.score.abs() > self.min_abs_score_for_side {
            return Some(if signal.score > 0.0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            });
        }
        None
    }

    /// Full tradeability decision: gating/confirm, then the quality filter.
    pub fn should_trade(&self, signal: &SignalV2) -> (bool, Option<String>) {
        if self.legacy_backtest_mode {
            return if signal.score.abs() >= self.min_abs_score_for_side {
                (true, None)
            } else {
                (false, Some("score_too_low_for_legacy_mode".to_string()))
            };
        }

        let (can_trade, reason) = is_tradeable(signal, self.gating_mode);
        if !can_trade {
            return (false, reason);
        }

        match self.quality_mode {
            QualityMode::All | QualityMode::Aggressive => (true, None),
            QualityMode::Conservative => {
                if signal.quality_tier == QualityTier::Strong {
                    (true, None)
                } else {
                    (
                        false,
                        Some(format!(
                            "quality_tier_{}_not_allowed_in_conservative_mode",
                            signal.quality_tier.as_str()
                        )),
                    )
                }
            }
            QualityMode::Balanced => match signal.quality_tier {
                QualityTier::Strong => (true, None),
                QualityTier::Normal => {
                    if signal.quality_flags.contains(&QualityFlag::LowConsistency) {
                        (false, Some("low_consistency_not_allowed_in_balanced_mode".to_string()))
                    } else {
                        (true, None)
                    }
                }
                QualityTier::Weak => (
                    false,
                    Some("quality_tier_weak_not_allowed_in_balanced_mode".to_string()),
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::guard;

    fn signal(gating: &[&str], confirm: bool) -> SignalV2 {
        SignalV2 {
            run_id: "run1".into(),
            symbol: "BTCUSDT".into(),
            ts_ms: 1_000,
            signal_id: SignalV2::make_id("run1", "BTCUSDT", 1_000, 0),
            gating: gating.iter().map(|s| s.to_string()).collect(),
            confirm,
            ..Default::default()
        }
    }

    #[test]
    fn test_hard_guard_blocks_every_mode() {
        let s = signal(&["fallback"], true);
        for mode in [GatingMode::Strict, GatingMode::IgnoreSoft, GatingMode::IgnoreAll] {
            let (ok, reason) = is_tradeable(&s, mode);
            assert!(!ok);
            assert_eq!(reason.as_deref(), Some("gating_hard_fallback"));
        }
    }

    #[test]
    fn test_soft_guard_modes() {
        let s = signal(&[guard::WEAK_SIGNAL], true);
        let (ok, reason) = is_tradeable(&s, GatingMode::Strict);
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("gating_weak_signal"));

        let (ok, reason) = is_tradeable(&s, GatingMode::IgnoreSoft);
        assert!(ok);
        assert!(reason.is_none());
    }

    #[test]
    fn test_ignore_soft_hard_still_blocks() {
        let s = signal(&[guard::WEAK_SIGNAL, "fallback"], true);
        let (ok, reason) = is_tradeable(&s, GatingMode::IgnoreSoft);
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("gating_hard_fallback"));
    }

    #[test]
    fn test_ignore_all_clears_structural_reasons() {
        let s = signal(&[guard::WARMUP, guard::WEAK_SIGNAL], true);
        let (ok, _) = is_tradeable(&s, GatingMode::IgnoreAll);
        assert!(ok);
        // Strict blocks on the full residual set
        let (ok, reason) = is_tradeable(&s, GatingMode::Strict);
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("gating_warmup,weak_signal"));
    }

    #[test]
    fn test_confirm_false_blocks() {
        let s = signal(&[], false);
        let (ok, reason) = is_tradeable(&s, GatingMode::Strict);
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("confirm_false"));
    }

    #[test]
    fn test_clean_signal_trades() {
        let s = signal(&[], true);
        let (ok, reason) = is_tradeable(&s, GatingMode::Strict);
        assert!(ok);
        assert!(reason.is_none());
    }

    #[test]
    fn test_decide_side_priority() {
        let policy = StrategyPolicy::default();

        let mut s = signal(&[], true);
        s.signal_type = SignalType::StrongBuy;
        s.side_hint = SideHint::Sell; // signal_type wins
        assert_eq!(policy.decide_side(&s), Some(OrderSide::Buy));

        let mut s = signal(&[], true);
        s.side_hint = SideHint::Sell;
        assert_eq!(policy.decide_side(&s), Some(OrderSide::Sell));

        let mut s = signal(&[], true);
        s.score = -0.5;
        assert_eq!(policy.decide_side(&s), Some(OrderSide::Sell));

        let mut s = signal(&[], true);
        s.score = 0.05; // below min_abs_score_for_side
        assert_eq!(policy.decide_side(&s), None);
    }

    #[test]
    fn test_legacy_mode_score_only() {
        let policy = StrategyPolicy::legacy(0.1);

        let mut s = signal(&[guard::WARMUP, "fallback"], false);
        s.score = 0.2;
        // Legacy mode ignores confirm and gating entirely
        let (ok, _) = policy.should_trade(&s);
        assert!(ok);

        s.score = 0.05;
        let (ok, reason) = policy.should_trade(&s);
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("score_too_low_for_legacy_mode"));
    }

    #[test]
    fn test_quality_modes() {
        let conservative =
            StrategyPolicy::new(GatingMode::Strict, QualityMode::Conservative, 0.1);
        let balanced = StrategyPolicy::new(GatingMode::Strict, QualityMode::Balanced, 0.1);

        let mut s = signal(&[], true);
        s.quality_tier = QualityTier::Normal;
        let (ok, reason) = conservative.should_trade(&s);
        assert!(!ok);
        assert_eq!(
            reason.as_deref(),
            Some("quality_tier_normal_not_allowed_in_conservative_mode")
        );
        let (ok, _) = balanced.should_trade(&s);
        assert!(ok);

        s.quality_flags = vec![QualityFlag::LowConsistency];
        let (ok, reason) = balanced.should_trade(&s);
        assert!(!ok);
        assert_eq!(
            reason.as_deref(),
            Some("low_consistency_not_allowed_in_balanced_mode")
        );

        s.quality_tier = QualityTier::Weak;
        s.quality_flags.clear();
        let (ok, _) = balanced.should_trade(&s);
        assert!(!ok);

        s.quality_tier = QualityTier::Strong;
        let (ok, _) = conservative.should_trade(&s);
        assert!(ok);
    }
}

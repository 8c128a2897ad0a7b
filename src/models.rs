//! Shared Domain Types
//!
//! Canonical types flowing through the pipeline: market regimes, the 2x2
//! activity/spread scenario grid, signal classification, quality labels, and
//! the per-second aligned feature row that every downstream component
//! consumes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Epoch milliseconds. All stream timestamps are carried in this unit.
pub type Millis = i64;

/// Epoch seconds (aligned row keys).
pub type Secs = i64;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MINUTE: i64 = 60_000;
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Qualitative market state label attached to each aligned row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Active,
    Quiet,
    #[default]
    Base,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Active => "active",
            Regime::Quiet => "quiet",
            Regime::Base => "base",
        }
    }

    /// Parse a regime label; anything unrecognized falls back to `Active`,
    /// which is also the threshold-table fallback in CoreAlgorithm.
    pub fn parse_or_active(s: &str) -> Self {
        match s {
            "active" => Regime::Active,
            "quiet" => Regime::Quiet,
            "base" => Regime::Base,
            _ => Regime::Active,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity (A/Q) x spread (H/L) scenario bucket used by the maker/taker
/// fill model and the per-scenario metrics breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Scenario2x2 {
    #[serde(rename = "A_H")]
    AH,
    #[serde(rename = "A_L")]
    AL,
    #[serde(rename = "Q_H")]
    QH,
    #[serde(rename = "Q_L")]
    QL,
    #[serde(rename = "unknown")]
    #[default]
    Unknown,
}

impl Scenario2x2 {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario2x2::AH => "A_H",
            Scenario2x2::AL => "A_L",
            Scenario2x2::QH => "Q_H",
            Scenario2x2::QL => "Q_L",
            Scenario2x2::Unknown => "unknown",
        }
    }

    /// Normalize a possibly-suffixed scenario label.
    ///
    /// Harvested rows sometimes carry labels like `A_H_unknown`; only the
    /// leading `X_Y` root identifies the bucket. An unrecognized root maps
    /// to `Unknown` (fee lookup then uses its `default` probability).
    pub fn normalize(label: &str) -> Self {
        let mut parts = label.split('_');
        let root = match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => format!("{}_{}", a, b),
            _ => return Scenario2x2::Unknown,
        };
        match root.as_str() {
            "A_H" => Scenario2x2::AH,
            "A_L" => Scenario2x2::AL,
            "Q_H" => Scenario2x2::QH,
            "Q_L" => Scenario2x2::QL,
            _ => Scenario2x2::Unknown,
        }
    }
}

impl fmt::Display for Scenario2x2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal quality tier derived from consistency, lag and spread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Strong,
    #[default]
    Normal,
    Weak,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Strong => "strong",
            QualityTier::Normal => "normal",
            QualityTier::Weak => "weak",
        }
    }
}

/// Quality degradation flags. Serialized as snake_case strings so the JSONL
/// rows stay greppable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    LowConsistency,
    LagBorderline,
    SpreadWide,
    Gap,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::LowConsistency => "low_consistency",
            QualityFlag::LagBorderline => "lag_borderline",
            QualityFlag::SpreadWide => "spread_wide",
            QualityFlag::Gap => "gap",
        }
    }
}

/// Typed signal classification produced by CoreAlgorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Buy,
    StrongBuy,
    Sell,
    StrongSell,
    #[default]
    Neutral,
    Pending,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Buy => "buy",
            SignalType::StrongBuy => "strong_buy",
            SignalType::Sell => "sell",
            SignalType::StrongSell => "strong_sell",
            SignalType::Neutral => "neutral",
            SignalType::Pending => "pending",
        }
    }

    /// Direction sign: +1 for buys, -1 for sells, 0 otherwise.
    #[inline]
    pub fn direction(&self) -> i8 {
        match self {
            SignalType::Buy | SignalType::StrongBuy => 1,
            SignalType::Sell | SignalType::StrongSell => -1,
            SignalType::Neutral | SignalType::Pending => 0,
        }
    }

    #[inline]
    pub fn is_directional(&self) -> bool {
        self.direction() != 0
    }
}

/// Execution side hint carried on signals. Serialized in upper case to match
/// the wire schema consumed by the executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SideHint {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "NONE")]
    #[default]
    None,
}

impl SideHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideHint::Buy => "BUY",
            SideHint::Sell => "SELL",
            SideHint::None => "NONE",
        }
    }

    #[inline]
    pub fn direction(&self) -> i8 {
        match self {
            SideHint::Buy => 1,
            SideHint::Sell => -1,
            SideHint::None => 0,
        }
    }

    pub fn from_direction(dir: i8) -> Self {
        match dir.signum() {
            1 => SideHint::Buy,
            -1 => SideHint::Sell,
            _ => SideHint::None,
        }
    }
}

/// Divergence label from the price-vs-fusion slope comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivType {
    BullDiv,
    BearDiv,
}

impl DivType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivType::BullDiv => "bull_div",
            DivType::BearDiv => "bear_div",
        }
    }
}

/// One aligned feature row per (symbol, second).
///
/// The aligner fills the key/price/gap/lag fields; FeaturePipe fills the
/// micro features and quality labels on top. All fields default so partial
/// rows recorded by older harvesters still parse in backtest mode A.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlignedFeatureRow {
    // Keys
    pub symbol: String,
    pub second_ts: Secs,
    /// End-of-second timestamp in epoch milliseconds.
    pub ts_ms: Millis,

    // Prices
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_bps: f64,

    // Micro features
    pub z_ofi: f64,
    pub z_cvd: f64,
    pub fusion_score: Option<f64>,
    /// Agreement measure in [0, 1].
    pub consistency: f64,
    /// 1 iff sign(z_ofi) == sign(z_cvd).
    pub sign_agree: u8,

    // Context
    pub regime: Regime,
    pub scenario_2x2: Scenario2x2,
    pub div_type: Option<DivType>,
    pub warmup: bool,
    pub is_gap_second: bool,
    pub lag_ms_price: i64,
    pub lag_ms_book: i64,
    pub obs_gap_ms_price_avg: f64,
    pub obs_gap_ms_book_avg: f64,
    /// Worst-source lag in seconds, the value gated by `lag_cap_sec`.
    pub lag_sec: f64,

    // Quality
    pub reason_codes: BTreeSet<String>,
    pub quality_tier: QualityTier,
    pub quality_flags: Vec<QualityFlag>,
}

impl AlignedFeatureRow {
    /// Worst-source lag, preferring the explicit `lag_sec` when recorded.
    #[inline]
    pub fn effective_lag_sec(&self) -> f64 {
        if self.lag_sec > 0.0 {
            self.lag_sec
        } else {
            self.lag_ms_price.max(self.lag_ms_book) as f64 / 1_000.0
        }
    }

    /// Minute bucket (epoch minutes) of this row's end-of-second timestamp.
    #[inline]
    pub fn minute_bucket(&self) -> i64 {
        self.ts_ms.div_euclid(MILLIS_PER_MINUTE)
    }
}

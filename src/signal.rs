//! Signal Schema (v2)
//!
//! Typed signal record emitted by CoreAlgorithm and mirrored by every sink.
//! The schema is versioned; the JSONL wire form is canonical: `ts_ms` first,
//! all remaining keys sorted, one UTF-8 JSON object per line.
//!
//! # Guard taxonomy
//!
//! Gating reasons split into hard and soft classes. Hard reasons always block
//! trading, even when a policy mode ignores gating; soft reasons may be
//! bypassed by `ignore_soft`/`ignore_all`. Reasons outside both classes
//! (warmup, dedup, streak, cooldown) block in strict mode and are cleared by
//! `ignore_all`.

use crate::models::{Millis, QualityFlag, QualityTier, Regime, SideHint, SignalType};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current signal schema version.
pub const SCHEMA_VERSION: &str = "v2";

/// Guards that block trading in every gating mode.
pub const HARD_GUARDS: &[&str] = &[
    "fallback",
    "price_cache_failed",
    "no_price",
    "spread_bps_exceeded",
    "lag_sec_exceeded",
    "kill_switch",
    "guarded",
];

/// Guards that may be bypassed by `ignore_soft`/`ignore_all`.
pub const SOFT_GUARDS: &[&str] = &["weak_signal", "low_consistency"];

/// Gating reason strings used by CoreAlgorithm.
pub mod guard {
    pub const WARMUP: &str = "warmup";
    pub const SPREAD_BPS_EXCEEDED: &str = "spread_bps_exceeded";
    pub const LAG_SEC_EXCEEDED: &str = "lag_sec_exceeded";
    pub const WEAK_SIGNAL: &str = "weak_signal";
    pub const LOW_CONSISTENCY: &str = "low_consistency";
    pub const DUPLICATE_WITHIN_WINDOW: &str = "duplicate_within_window";
    pub const REVERSE_COOLDOWN_INSUFFICIENT_TICKS: &str = "reverse_cooldown_insufficient_ticks";
    pub const ADAPTIVE_COOLDOWN: &str = "adaptive_cooldown";
    pub const NO_PRICE: &str = "no_price";
}

#[inline]
pub fn is_hard_guard(reason: &str) -> bool {
    HARD_GUARDS.contains(&reason)
}

#[inline]
pub fn is_soft_guard(reason: &str) -> bool {
    SOFT_GUARDS.contains(&reason)
}

/// Machine-readable decision outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCode {
    /// Confirmed, no blocking reasons.
    Ok,
    /// Warmup rows: not yet classifiable.
    #[default]
    Pending,
    /// Blocked by a hard or soft guard.
    Gated,
    /// Suppressed by the dedup window.
    Duplicate,
    /// Directional but streak not yet sufficient.
    Unconfirmed,
    /// Blocked by the adaptive cooldown.
    Cooldown,
}

impl DecisionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::Ok => "ok",
            DecisionCode::Pending => "pending",
            DecisionCode::Gated => "gated",
            DecisionCode::Duplicate => "duplicate",
            DecisionCode::Unconfirmed => "unconfirmed",
            DecisionCode::Cooldown => "cooldown",
        }
    }
}

/// Versioned signal record (schema v2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SignalV2 {
    // Identity
    pub run_id: String,
    pub symbol: String,
    pub ts_ms: Millis,
    pub signal_id: String,
    pub schema_version: String,

    // Decision
    pub score: f64,
    pub signal_type: SignalType,
    pub side_hint: SideHint,
    pub confirm: bool,
    pub gating: Vec<String>,

    // Context
    pub regime: Regime,
    pub consistency: f64,
    pub z_ofi: f64,
    pub z_cvd: f64,
    pub spread_bps: f64,
    pub lag_sec: f64,
    pub mid_px: f64,

    // Policy
    pub cooldown_ms: i64,
    pub expiry_ms: i64,
    pub decision_code: DecisionCode,
    pub decision_reason: Option<String>,
    pub guard_reason: Option<String>,
    pub quality_tier: QualityTier,
    pub quality_flags: Vec<QualityFlag>,
    pub config_hash: String,

    /// Non-canonical extras preserved across the sinks.
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl SignalV2 {
    /// Build the unique signal identifier: `{run_id}-{symbol}-{ts_ms}-{seq}`.
    pub fn make_id(run_id: &str, symbol: &str, ts_ms: Millis, seq: u64) -> String {
        format!("{}-{}-{}-{}", run_id, symbol, ts_ms, seq)
    }

    /// True if any gating reason is in the hard class.
    pub fn has_hard_guard(&self) -> bool {
        self.gating.iter().any(|g| is_hard_guard(g))
    }

    /// Direction implied by `signal_type`, falling back to `side_hint`.
    #[inline]
    pub fn direction(&self) -> i8 {
        let d = self.signal_type.direction();
        if d != 0 {
            d
        } else {
            self.side_hint.direction()
        }
    }

    /// Minute bucket (epoch minutes) for parity windows.
    #[inline]
    pub fn minute_bucket(&self) -> i64 {
        self.ts_ms.div_euclid(crate::models::MILLIS_PER_MINUTE)
    }

    /// Canonical JSONL encoding: `ts_ms` first, remaining keys sorted.
    /// The line does NOT include the trailing newline; the sink appends it.
    pub fn to_jsonl_line(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        let map = value
            .as_object()
            .ok_or_else(|| anyhow!("signal serialized to non-object JSON"))?;

        let mut line = String::with_capacity(512);
        line.push_str("{\"ts_ms\":");
        line.push_str(&self.ts_ms.to_string());
        // serde_json's default map is ordered by key, so iteration is the
        // deterministic sorted order the wire format requires.
        for (key, val) in map {
            if key == "ts_ms" {
                continue;
            }
            line.push(',');
            line.push_str(&serde_json::to_string(key)?);
            line.push(':');
            line.push_str(&serde_json::to_string(val)?);
        }
        line.push('}');
        Ok(line)
    }

    /// Check the schema invariants. Used by tests and by sinks in debug
    /// builds before a row is persisted.
    pub fn validate(&self) -> Result<()> {
        let expected_id = Self::make_id(
            &self.run_id,
            &self.symbol,
            self.ts_ms,
            self.seq_from_id().unwrap_or(0),
        );
        if self.signal_id != expected_id {
            return Err(anyhow!(
                "signal_id {:?} does not match {{run_id}}-{{symbol}}-{{ts_ms}}-{{seq}}",
                self.signal_id
            ));
        }
        if self.confirm && self.has_hard_guard() {
            return Err(anyhow!(
                "confirm=true with hard guard(s): {:?}",
                self.gating
            ));
        }
        let hint_dir = self.side_hint.direction();
        let type_dir = self.signal_type.direction();
        if hint_dir != 0 && type_dir != 0 && hint_dir != type_dir {
            return Err(anyhow!(
                "side_hint {} contradicts signal_type {}",
                self.side_hint.as_str(),
                self.signal_type.as_str()
            ));
        }
        Ok(())
    }

    /// Extract the trailing sequence number from `signal_id`.
    pub fn seq_from_id(&self) -> Option<u64> {
        self.signal_id.rsplit('-').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SignalV2 {
        SignalV2 {
            run_id: "run1".into(),
            symbol: "BTCUSDT".into(),
            ts_ms: 1_731_470_000_000,
            signal_id: SignalV2::make_id("run1", "BTCUSDT", 1_731_470_000_000, 0),
            schema_version: SCHEMA_VERSION.into(),
            score: 1.38,
            signal_type: SignalType::StrongBuy,
            side_hint: SideHint::Buy,
            confirm: true,
            gating: vec![],
            regime: Regime::Active,
            consistency: 0.9,
            z_ofi: 1.5,
            z_cvd: 1.2,
            spread_bps: 5.0,
            lag_sec: 0.1,
            mid_px: 50_000.0,
            cooldown_ms: 5_000,
            expiry_ms: 30_000,
            decision_code: DecisionCode::Ok,
            config_hash: "abc123".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_guard_classes_disjoint() {
        for hard in HARD_GUARDS {
            assert!(!is_soft_guard(hard));
        }
        for soft in SOFT_GUARDS {
            assert!(!is_hard_guard(soft));
        }
        // Residual reasons are in neither class
        assert!(!is_hard_guard(guard::WARMUP));
        assert!(!is_soft_guard(guard::WARMUP));
        assert!(!is_hard_guard(guard::DUPLICATE_WITHIN_WINDOW));
    }

    #[test]
    fn test_jsonl_line_ts_ms_first_then_sorted() {
        let line = sample().to_jsonl_line().unwrap();
        assert!(line.starts_with("{\"ts_ms\":1731470000000,"));
        // Remaining keys must appear in sorted order
        let keys: Vec<&str> = line
            .match_indices('\"')
            .collect::<Vec<_>>()
            .chunks(2)
            .filter_map(|pair| {
                let start = pair[0].0 + 1;
                let end = pair.get(1)?.0;
                let token = &line[start..end];
                // keep only tokens followed by a colon (keys)
                line[end + 1..].starts_with(':').then_some(token)
            })
            .collect();
        let after_ts: Vec<&str> = keys.iter().skip(1).copied().collect();
        let mut sorted = after_ts.clone();
        sorted.sort_unstable();
        assert_eq!(after_ts, sorted, "keys after ts_ms not sorted: {:?}", keys);
        // Round-trips through serde
        let parsed: SignalV2 = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.signal_id, sample().signal_id);
        assert_eq!(parsed.signal_type, SignalType::StrongBuy);
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        sample().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_confirmed_hard_guard() {
        let mut s = sample();
        s.gating = vec![guard::SPREAD_BPS_EXCEEDED.to_string()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_contradicting_direction() {
        let mut s = sample();
        s.side_hint = SideHint::Sell;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_seq_from_id() {
        let mut s = sample();
        s.signal_id = SignalV2::make_id("run1", "BTCUSDT", s.ts_ms, 42);
        assert_eq!(s.seq_from_id(), Some(42));
    }
}

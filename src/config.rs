//! Pipeline Configuration
//!
//! Typed configuration for the feature pipe, CoreAlgorithm, sinks and the
//! backtest executor. Loaded once at startup from an optional JSON file,
//! then environment overrides are applied exactly once; the merged result is
//! immutable for the lifetime of the process.
//!
//! Validation failures are fatal at startup (CLI exit code 2). Nothing here
//! is revalidated mid-run.
//!
//! `config_hash` is the SHA-1 of the canonical (sorted-key) JSON encoding of
//! the merged configuration and is stamped on every signal and manifest.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Sink selection (`V13_SINK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkChoice {
    Jsonl,
    Sqlite,
    #[default]
    Dual,
}

/// Input tree selection (`V13_INPUT_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Raw,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModelKind {
    #[default]
    Static,
    Linear,
    Piecewise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeeModelKind {
    #[default]
    TakerStatic,
    Tiered,
    MakerTaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    #[default]
    Weighted,
    Zsum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CvdZMode {
    #[default]
    Delta,
    Cumulative,
}

/// Per-regime signal classification thresholds. Sell thresholds are
/// negative scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    pub buy: f64,
    pub strong_buy: f64,
    pub sell: f64,
    pub strong_sell: f64,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            buy: 0.6,
            strong_buy: 1.2,
            sell: -0.6,
            strong_sell: -1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub weak_signal_threshold: f64,
    pub consistency_min: f64,
    pub spread_bps_cap: f64,
    pub lag_cap_sec: f64,
    pub dedupe_ms: i64,
    pub min_consecutive_same_dir: u32,
    pub adaptive_cooldown_k: f64,
    pub base_cooldown_ms: i64,
    pub expiry_ms: i64,
    /// Thresholds keyed by regime label; unknown regimes fall back to
    /// `active` at decision time.
    pub thresholds: BTreeMap<String, ThresholdSet>,
    pub min_abs_score_for_side: f64,
    /// Recompute fusion from weights even when the row carries a score.
    pub recompute_fusion: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("active".to_string(), ThresholdSet::default());
        thresholds.insert(
            "quiet".to_string(),
            ThresholdSet {
                buy: 0.8,
                strong_buy: 1.5,
                sell: -0.8,
                strong_sell: -1.5,
            },
        );
        thresholds.insert("base".to_string(), ThresholdSet::default());
        Self {
            weak_signal_threshold: 0.2,
            consistency_min: 0.15,
            spread_bps_cap: 20.0,
            lag_cap_sec: 2.0,
            dedupe_ms: 1_000,
            min_consecutive_same_dir: 2,
            adaptive_cooldown_k: 1.0,
            base_cooldown_ms: 5_000,
            expiry_ms: 30_000,
            thresholds,
            min_abs_score_for_side: 0.1,
            recompute_fusion: false,
        }
    }
}

impl SignalConfig {
    /// Threshold set for a regime label, falling back to `active`.
    pub fn thresholds_for(&self, regime: &str) -> ThresholdSet {
        self.thresholds
            .get(regime)
            .or_else(|| self.thresholds.get("active"))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfiConfig {
    pub window_ms: i64,
    /// Z-score normalization window in milliseconds.
    pub zscore_window: i64,
    pub levels: usize,
    /// Per-level weights; empty means geometric decay over `levels`.
    pub weights: Vec<f64>,
    pub ema_alpha: f64,
}

impl Default for OfiConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            zscore_window: 30_000,
            levels: 5,
            weights: vec![0.4, 0.25, 0.2, 0.1, 0.05],
            ema_alpha: 0.2,
        }
    }
}

impl OfiConfig {
    /// Effective per-level weights: configured, or geometric decay.
    pub fn effective_weights(&self) -> Vec<f64> {
        if !self.weights.is_empty() {
            return self.weights.clone();
        }
        let mut w = Vec::with_capacity(self.levels);
        let mut cur = 1.0;
        for _ in 0..self.levels {
            w.push(cur);
            cur *= 0.5;
        }
        let total: f64 = w.iter().sum();
        w.iter().map(|x| x / total).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvdConfig {
    pub window_ms: i64,
    pub z_mode: CvdZMode,
}

impl Default for CvdConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            z_mode: CvdZMode::Delta,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub w_ofi: f64,
    pub w_cvd: f64,
    pub method: FusionMethod,
    /// Sub-second bursts collapsing into one aligned second: only the last
    /// update inside this window contributes to the closed row.
    pub burst_coalesce_ms: i64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            w_ofi: 0.6,
            w_cvd: 0.4,
            method: FusionMethod::Weighted,
            burst_coalesce_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceConfig {
    pub lookback_bars: usize,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self { lookback_bars: 60 }
    }
}

/// Activity/spread bucketing for the 2x2 scenario grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Trade-activity sampling window in milliseconds.
    pub activity_window_ms: i64,
    /// Quantile of the rolling activity distribution separating A from Q.
    pub activity_quantile: f64,
    /// Spread at or above this is the H band.
    pub spread_high_bps: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            activity_window_ms: 60_000,
            activity_quantile: 0.5,
            spread_high_bps: 2.0,
        }
    }
}

/// Regime labeling thresholds (trades per minute).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub window_ms: i64,
    pub active_min_tpm: f64,
    pub quiet_max_tpm: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            active_min_tpm: 20.0,
            quiet_max_tpm: 5.0,
        }
    }
}

/// Quality flag thresholds and tier boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub low_consistency: f64,
    pub strong_consistency: f64,
    pub lag_borderline_sec: f64,
    pub spread_wide_bps: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            low_consistency: 0.3,
            strong_consistency: 0.7,
            lag_borderline_sec: 1.0,
            spread_wide_bps: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComponentsConfig {
    pub fusion: FusionConfig,
    pub ofi: OfiConfig,
    pub cvd: CvdConfig,
    pub divergence: DivergenceConfig,
    pub scenario: ScenarioConfig,
    pub regime: RegimeConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioProbs {
    #[serde(rename = "A_H")]
    pub a_h: f64,
    #[serde(rename = "A_L")]
    pub a_l: f64,
    #[serde(rename = "Q_H")]
    pub q_h: f64,
    #[serde(rename = "Q_L")]
    pub q_l: f64,
    pub default: f64,
}

impl Default for ScenarioProbs {
    fn default() -> Self {
        Self {
            a_h: 0.35,
            a_l: 0.30,
            q_h: 0.25,
            q_l: 0.20,
            default: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SideBias {
    pub buy: f64,
    pub sell: f64,
}

impl Default for SideBias {
    fn default() -> Self {
        Self {
            buy: 1.0,
            sell: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeMakerTakerConfig {
    pub scenario_probs: ScenarioProbs,
    pub spread_slope: f64,
    pub spread_threshold_narrow: f64,
    pub spread_threshold_wide: f64,
    /// Maker fee as a fraction of the taker fee.
    pub maker_fee_ratio: f64,
    pub side_bias: SideBias,
}

impl Default for FeeMakerTakerConfig {
    fn default() -> Self {
        Self {
            scenario_probs: ScenarioProbs::default(),
            spread_slope: 0.1,
            spread_threshold_narrow: 1.0,
            spread_threshold_wide: 10.0,
            maker_fee_ratio: 0.5,
            side_bias: SideBias::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSection {
    pub taker_fee_bps: f64,
    pub slippage_bps: f64,
    pub notional_per_trade: f64,
    pub reverse_on_signal: bool,
    pub take_profit_bps: Option<f64>,
    pub stop_loss_bps: Option<f64>,
    pub min_hold_time_sec: Option<f64>,
    pub max_hold_time_sec: Option<f64>,
    pub ignore_gating_in_backtest: bool,
    pub rollover_timezone: String,
    pub rollover_hour: u8,
    pub slippage_model: SlippageModelKind,
    pub fee_model: FeeModelKind,
}

impl Default for BacktestSection {
    fn default() -> Self {
        Self {
            taker_fee_bps: 2.0,
            slippage_bps: 1.0,
            notional_per_trade: 1_000.0,
            reverse_on_signal: false,
            take_profit_bps: None,
            stop_loss_bps: None,
            min_hold_time_sec: None,
            max_hold_time_sec: None,
            ignore_gating_in_backtest: true,
            rollover_timezone: "UTC".to_string(),
            rollover_hour: 0,
            slippage_model: SlippageModelKind::Static,
            fee_model: FeeModelKind::TakerStatic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotateConfig {
    pub max_rows: u64,
    pub max_sec: u64,
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            max_rows: 50_000,
            max_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub batch_n: usize,
    pub flush_ms: i64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            batch_n: 200,
            flush_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimeseriesConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

/// Merged pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backtest: BacktestSection,
    pub signal: SignalConfig,
    pub components: ComponentsConfig,
    pub fee_maker_taker: FeeMakerTakerConfig,
    pub rotate: RotateConfig,
    pub sqlite: SqliteConfig,
    pub fsync_every_n: u64,
    pub replay_mode: bool,
    pub sink: SinkChoice,
    pub input_mode: InputMode,
    pub timeseries: TimeseriesConfig,
    /// Seconds allowed for the cooperative shutdown drain.
    pub shutdown_grace_sec: u64,
    /// Aligner gap threshold before rows are flagged `gap`.
    pub gap_threshold_sec: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backtest: BacktestSection::default(),
            signal: SignalConfig::default(),
            components: ComponentsConfig::default(),
            fee_maker_taker: FeeMakerTakerConfig::default(),
            rotate: RotateConfig::default(),
            sqlite: SqliteConfig::default(),
            fsync_every_n: 100,
            replay_mode: false,
            sink: SinkChoice::Dual,
            input_mode: InputMode::Raw,
            timeseries: TimeseriesConfig::default(),
            shutdown_grace_sec: 10,
            gap_threshold_sec: 5,
        }
    }
}

impl Config {
    pub fn new_with_defaults() -> Self {
        Self::default()
    }

    /// Load a JSON config file, or defaults when `path` is None, then apply
    /// environment overrides once.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => Self::new_with_defaults(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment overrides. Called exactly once at
    /// startup; the merged config is immutable afterwards.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("V13_REPLAY_MODE") {
            self.replay_mode = v;
        }
        if let Some(v) = env_str("V13_SINK") {
            match v.as_str() {
                "jsonl" => self.sink = SinkChoice::Jsonl,
                "sqlite" => self.sink = SinkChoice::Sqlite,
                "dual" => self.sink = SinkChoice::Dual,
                other => tracing::warn!(value = other, "ignoring unknown V13_SINK"),
            }
        }
        if let Some(v) = env_str("V13_INPUT_MODE") {
            match v.as_str() {
                "raw" => self.input_mode = InputMode::Raw,
                "preview" => self.input_mode = InputMode::Preview,
                other => tracing::warn!(value = other, "ignoring unknown V13_INPUT_MODE"),
            }
        }
        if let Some(v) = env_parse::<usize>("SQLITE_BATCH_N") {
            self.sqlite.batch_n = v;
        }
        if let Some(v) = env_parse::<i64>("SQLITE_FLUSH_MS") {
            self.sqlite.flush_ms = v;
        }
        if let Some(v) = env_parse::<u64>("FSYNC_EVERY_N") {
            self.fsync_every_n = v;
        }
        if let Some(v) = env_bool("TIMESERIES_ENABLED") {
            self.timeseries.enabled = v;
        }
        if let Some(v) = env_str("TIMESERIES_TYPE") {
            self.timeseries.kind = v;
        }
        if let Some(v) = env_str("TIMESERIES_URL") {
            self.timeseries.url = v;
        }
        if let Some(v) = env_str("ROLLOVER_TZ") {
            self.backtest.rollover_timezone = v;
        }
        if let Some(v) = env_parse::<u8>("ROLLOVER_HOUR") {
            self.backtest.rollover_hour = v;
        }
        if let Some(v) = env_parse::<f64>("TAKER_FEE_BPS") {
            self.backtest.taker_fee_bps = v;
        }
        if let Some(v) = env_parse::<f64>("SLIPPAGE_BPS") {
            self.backtest.slippage_bps = v;
        }
        if let Some(v) = env_parse::<f64>("NOTIONAL_PER_TRADE") {
            self.backtest.notional_per_trade = v;
        }
        if let Some(v) = env_bool("IGNORE_GATING") {
            self.backtest.ignore_gating_in_backtest = v;
        }
    }

    /// Startup validation. Any failure here is a configuration error and
    /// maps to CLI exit code 2; nothing is revalidated mid-run.
    pub fn validate(&self) -> Result<()> {
        let fusion = &self.components.fusion;
        if (fusion.w_ofi + fusion.w_cvd - 1.0).abs() > 1e-9 {
            bail!(
                "fusion weights must satisfy w_ofi + w_cvd = 1 (got {} + {})",
                fusion.w_ofi,
                fusion.w_cvd
            );
        }
        if self.backtest.rollover_hour > 23 {
            bail!("rollover_hour must be 0-23, got {}", self.backtest.rollover_hour);
        }
        if self.backtest.rollover_timezone != "UTC"
            && chrono_tz::Tz::from_str(&self.backtest.rollover_timezone).is_err()
        {
            bail!("invalid rollover_timezone: {}", self.backtest.rollover_timezone);
        }
        let ofi = &self.components.ofi;
        if !ofi.weights.is_empty() && ofi.weights.len() != ofi.levels {
            bail!(
                "ofi.weights length {} does not match ofi.levels {}",
                ofi.weights.len(),
                ofi.levels
            );
        }
        if !(0.0..=1.0).contains(&ofi.ema_alpha) {
            bail!("ofi.ema_alpha must be in [0, 1], got {}", ofi.ema_alpha);
        }
        if !(0.0..=1.0).contains(&self.signal.consistency_min) {
            bail!(
                "signal.consistency_min must be in [0, 1], got {}",
                self.signal.consistency_min
            );
        }
        if self.signal.dedupe_ms < 0 || self.signal.base_cooldown_ms < 0 {
            bail!("signal windows must be non-negative");
        }
        if self.signal.min_consecutive_same_dir == 0 {
            bail!("signal.min_consecutive_same_dir must be at least 1");
        }
        let fees = &self.fee_maker_taker;
        if fees.spread_threshold_wide <= fees.spread_threshold_narrow {
            bail!(
                "fee_maker_taker spread thresholds must be narrow < wide ({} >= {})",
                fees.spread_threshold_narrow,
                fees.spread_threshold_wide
            );
        }
        if self.sqlite.batch_n == 0 {
            bail!("sqlite.batch_n must be at least 1");
        }
        if self.rotate.max_rows == 0 {
            bail!("rotate.max_rows must be at least 1");
        }
        Ok(())
    }

    /// SHA-1 of the canonical (sorted-key) JSON encoding of this config.
    pub fn config_hash(&self) -> String {
        // serde_json's map is key-ordered, so the encoding is canonical.
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Resolve the process run id: `RUN_ID` env or a fresh UUID.
    pub fn resolve_run_id() -> String {
        env_str("RUN_ID").unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::new_with_defaults().validate().unwrap();
    }

    #[test]
    fn test_fusion_weight_constraint() {
        let mut config = Config::new_with_defaults();
        config.components.fusion.w_ofi = 0.7;
        config.components.fusion.w_cvd = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut config = Config::new_with_defaults();
        config.backtest.rollover_timezone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate().is_err());
        config.backtest.rollover_timezone = "Asia/Tokyo".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_config_hash_stable_and_sensitive() {
        let a = Config::new_with_defaults();
        let b = Config::new_with_defaults();
        assert_eq!(a.config_hash(), b.config_hash());

        let mut c = Config::new_with_defaults();
        c.signal.weak_signal_threshold = 0.3;
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn test_threshold_fallback_to_active() {
        let config = Config::new_with_defaults();
        let unknown = config.signal.thresholds_for("volatile");
        let active = config.signal.thresholds_for("active");
        assert_eq!(unknown, active);
    }

    #[test]
    fn test_geometric_weights_normalized() {
        let ofi = OfiConfig {
            weights: vec![],
            levels: 4,
            ..Default::default()
        };
        let w = ofi.effective_weights();
        assert_eq!(w.len(), 4);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w[0] > w[1] && w[1] > w[2] && w[2] > w[3]);
    }

    #[test]
    fn test_json_section_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "backtest": {"taker_fee_bps": 3.5, "fee_model": "maker_taker"},
                "signal": {"thresholds": {"active": {"buy": 0.5, "strong_buy": 1.0}}},
                "components": {"fusion": {"w_ofi": 0.7, "w_cvd": 0.3}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.backtest.fee_model, FeeModelKind::MakerTaker);
        assert!((config.backtest.taker_fee_bps - 3.5).abs() < 1e-12);
        let th = config.signal.thresholds_for("active");
        assert!((th.buy - 0.5).abs() < 1e-12);
        // Defaulted fields still present
        assert!((th.sell - (-0.6)).abs() < 1e-12);
        assert!((config.components.fusion.w_ofi - 0.7).abs() < 1e-12);
    }
}

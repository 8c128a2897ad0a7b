//! Backtest Metrics
//!
//! Aggregates the trade stream into run-level metrics plus per-symbol,
//! per-hour, per-day and per-scenario breakdowns, and writes the artifact
//! files `metrics.json`, `pnl_daily.jsonl` and `scenario_breakdown.json`.
//!
//! Conventions:
//! - `avg_hold_sec` counts only closed (entry, exit) pairs.
//! - Sharpe/Sortino annualize daily PnL by sqrt(252); returns by 252.
//! - MAR = annual_return / max_drawdown; unbounded (reported via
//!   `mar_unbounded`) when the drawdown is zero with positive PnL, zero
//!   otherwise.
//! - Trades are attributed to the day of their `entry_ts_ms` under the
//!   configured rollover timezone and hour; attribution is by UTC instant,
//!   so a DST fall-back doubling of a local hour cannot double-count.

use crate::backtest::simulator::TradeRecord;
use crate::models::Millis;
use crate::paths::utc_from_millis;
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Shared shape of the overall metrics and every breakdown bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub total_pnl: f64,
    pub total_fee: f64,
    pub total_slippage: f64,
    pub total_turnover: f64,
    pub total_trades: u64,
    pub win_rate: f64,
    pub avg_hold_sec: f64,
}

#[derive(Debug, Clone, Default)]
struct BucketAccum {
    net_pnl: f64,
    fee: f64,
    slippage: f64,
    turnover: f64,
    exits: u64,
    wins: u64,
    hold_sec_sum: f64,
}

impl BucketAccum {
    fn record(&mut self, trade: &TradeRecord) {
        let notional = trade.qty * trade.exec_px;
        self.turnover += notional;
        self.fee += trade.fee;
        // Slippage was charged at half the modeled bps on this execution.
        self.slippage += notional * trade.slippage_bps / 2.0 / 10_000.0;
        if trade.reason.is_exit() {
            self.exits += 1;
            self.net_pnl += trade.net_pnl;
            self.hold_sec_sum += trade.hold_time_s;
            if trade.net_pnl > 0.0 {
                self.wins += 1;
            }
        }
    }

    fn finish(&self) -> BucketMetrics {
        BucketMetrics {
            total_pnl: self.net_pnl,
            total_fee: self.fee,
            total_slippage: self.slippage,
            total_turnover: self.turnover,
            total_trades: self.exits,
            win_rate: if self.exits == 0 {
                0.0
            } else {
                self.wins as f64 / self.exits as f64
            },
            avg_hold_sec: if self.exits == 0 {
                0.0
            } else {
                self.hold_sec_sum / self.exits as f64
            },
        }
    }
}

/// One daily PnL record per (day, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPnl {
    pub day: NaiveDate,
    pub symbol: String,
    pub net_pnl: f64,
    pub gross_pnl: f64,
    pub fee: f64,
    pub trades: u64,
}

/// Full run metrics artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(flatten)]
    pub overall: BucketMetrics,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub annual_return: f64,
    pub mar: Option<f64>,
    pub mar_unbounded: bool,
    pub cost_bps_on_turnover: f64,
    pub per_symbol: BTreeMap<String, BucketMetrics>,
    pub per_hour: BTreeMap<u8, BucketMetrics>,
    pub per_scenario: BTreeMap<String, BucketMetrics>,
}

/// Aggregates trades under a rollover-day convention.
pub struct MetricsAggregator {
    timezone: Option<Tz>,
    rollover_hour: u8,
}

impl MetricsAggregator {
    /// `timezone` as validated by the config ("UTC" or an IANA name).
    pub fn new(timezone: &str, rollover_hour: u8) -> Result<Self> {
        let timezone = if timezone == "UTC" {
            None
        } else {
            Some(
                Tz::from_str(timezone)
                    .map_err(|_| anyhow::anyhow!("invalid rollover timezone: {}", timezone))?,
            )
        };
        Ok(Self {
            timezone,
            rollover_hour,
        })
    }

    /// Trading day a timestamp belongs to. The rollover hour shifts the day
    /// boundary; the hour is interpreted in the configured timezone (UTC
    /// when the timezone is UTC).
    pub fn trading_day(&self, ts_ms: Millis) -> NaiveDate {
        let utc = utc_from_millis(ts_ms);
        let shifted = utc - Duration::hours(self.rollover_hour as i64);
        match self.timezone {
            None => shifted.date_naive(),
            Some(tz) => shifted.with_timezone(&tz).date_naive(),
        }
    }

    /// Aggregate the full trade stream.
    pub fn aggregate(&self, trades: &[TradeRecord]) -> (RunMetrics, Vec<DailyPnl>) {
        let mut overall = BucketAccum::default();
        let mut per_symbol: BTreeMap<String, BucketAccum> = BTreeMap::new();
        let mut per_hour: BTreeMap<u8, BucketAccum> = BTreeMap::new();
        let mut per_scenario: BTreeMap<String, BucketAccum> = BTreeMap::new();

        #[derive(Default)]
        struct DayAccum {
            net: f64,
            gross: f64,
            fee: f64,
            trades: u64,
        }
        let mut daily: BTreeMap<(NaiveDate, String), DayAccum> = BTreeMap::new();

        // Equity curve over exits in insertion order, for drawdown.
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_drawdown = 0.0f64;

        for trade in trades {
            overall.record(trade);
            per_symbol
                .entry(trade.symbol.clone())
                .or_default()
                .record(trade);
            per_hour
                .entry(utc_from_millis(trade.ts_ms).hour() as u8)
                .or_default()
                .record(trade);
            per_scenario
                .entry(trade.scenario_2x2.as_str().to_string())
                .or_default()
                .record(trade);

            if trade.reason.is_exit() {
                // Attribution is by the entry instant of the closed pair.
                let entry_ts = trade.ts_ms - (trade.hold_time_s * 1_000.0) as Millis;
                let day = self.trading_day(entry_ts);
                let bucket = daily.entry((day, trade.symbol.clone())).or_default();
                bucket.net += trade.net_pnl;
                bucket.gross += trade.gross_pnl;
                bucket.fee += trade.fee;
                bucket.trades += 1;

                equity += trade.net_pnl;
                peak = peak.max(equity);
                max_drawdown = max_drawdown.max(peak - equity);
            }
        }

        let daily_records: Vec<DailyPnl> = daily
            .into_iter()
            .map(|((day, symbol), accum)| DailyPnl {
                day,
                symbol,
                net_pnl: accum.net,
                gross_pnl: accum.gross,
                fee: accum.fee,
                trades: accum.trades,
            })
            .collect();

        // Daily net series across symbols for the ratio metrics.
        let mut day_totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for record in &daily_records {
            *day_totals.entry(record.day).or_default() += record.net_pnl;
        }
        let series: Vec<f64> = day_totals.values().copied().collect();
        let (sharpe, sortino, annual_return) = ratio_metrics(&series);

        let overall_metrics = overall.finish();
        let mar_unbounded = max_drawdown == 0.0 && overall_metrics.total_pnl > 0.0;
        let mar = if mar_unbounded {
            None
        } else if max_drawdown == 0.0 {
            Some(0.0)
        } else {
            Some(annual_return / max_drawdown)
        };
        let cost_bps_on_turnover = if overall_metrics.total_turnover > 0.0 {
            (overall_metrics.total_fee + overall_metrics.total_slippage)
                / overall_metrics.total_turnover
                * 10_000.0
        } else {
            0.0
        };

        let metrics = RunMetrics {
            overall: overall_metrics,
            sharpe,
            sortino,
            max_drawdown,
            annual_return,
            mar,
            mar_unbounded,
            cost_bps_on_turnover,
            per_symbol: finish_map(per_symbol),
            per_hour: finish_map(per_hour),
            per_scenario: finish_map(per_scenario),
        };
        (metrics, daily_records)
    }

    /// Write `metrics.json`, `pnl_daily.jsonl` and `scenario_breakdown.json`.
    pub fn write_artifacts(
        &self,
        out_dir: &Path,
        metrics: &RunMetrics,
        daily: &[DailyPnl],
    ) -> Result<()> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;

        let metrics_path = out_dir.join("metrics.json");
        fs::write(&metrics_path, serde_json::to_string_pretty(metrics)?)
            .with_context(|| format!("writing {}", metrics_path.display()))?;

        let mut pnl_lines = String::new();
        for record in daily {
            pnl_lines.push_str(&serde_json::to_string(record)?);
            pnl_lines.push('\n');
        }
        fs::write(out_dir.join("pnl_daily.jsonl"), pnl_lines)?;

        fs::write(
            out_dir.join("scenario_breakdown.json"),
            serde_json::to_string_pretty(&metrics.per_scenario)?,
        )?;
        Ok(())
    }
}

fn finish_map<K: Ord>(map: BTreeMap<K, BucketAccum>) -> BTreeMap<K, BucketMetrics> {
    map.into_iter().map(|(k, v)| (k, v.finish())).collect()
}

/// (sharpe, sortino, annual_return) from a daily PnL series.
fn ratio_metrics(daily: &[f64]) -> (f64, f64, f64) {
    if daily.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = daily.len() as f64;
    let mean = daily.iter().sum::<f64>() / n;
    let annual_return = mean * TRADING_DAYS_PER_YEAR;

    let var = daily.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    let sharpe = if std > 0.0 {
        mean / std * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let downside: Vec<f64> = daily.iter().copied().filter(|x| *x < 0.0).collect();
    let sortino = if downside.is_empty() {
        0.0
    } else {
        let downside_var =
            downside.iter().map(|x| x.powi(2)).sum::<f64>() / downside.len() as f64;
        let downside_std = downside_var.sqrt();
        if downside_std > 0.0 {
            mean / downside_std * TRADING_DAYS_PER_YEAR.sqrt()
        } else {
            0.0
        }
    };
    (sharpe, sortino, annual_return)
}

//! Trade Simulator
//!
//! Deterministic execution simulation over the signal stream: at most one
//! position per symbol, entries on tradeable confirmed signals, exits
//! checked in a fixed order on every tick:
//!
//! 1. `timeout` when the hold time reaches `max_hold_time_sec`
//! 2. `stop_loss` on adverse excursion beyond `stop_loss_bps`
//! 3. `take_profit` beyond `take_profit_bps`, only after `min_hold_time_sec`
//! 4. `reverse` on a tradeable opposite signal (single atomic record)
//! 5. `rollover_close` for positions still open when the run ends
//!
//! Slippage is embedded in `exec_px` once; `net_pnl = gross_pnl - entry_fee
//! - exit_fee`. A reversal emits exactly one trade record carrying the
//! round-trip PnL of the closed position; the replacement position opens at
//! the same `ts_ms`.

use crate::backtest::fees::FeeEngine;
use crate::backtest::slippage::SlippageModel;
use crate::config::BacktestSection;
use crate::models::{Millis, Scenario2x2};
use crate::signal::SignalV2;
use crate::strategy::{OrderSide, StrategyPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn from_order(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    /// Order side that closes this position.
    pub fn closing_order(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

/// Why a trade record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeReason {
    Entry,
    Exit,
    Reverse,
    StopLoss,
    TakeProfit,
    Timeout,
    RolloverClose,
}

impl TradeReason {
    #[inline]
    pub fn is_exit(&self) -> bool {
        !matches!(self, TradeReason::Entry)
    }
}

/// One open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_px: f64,
    pub entry_ts_ms: Millis,
    pub notional: f64,
    pub entry_fee: f64,
    pub scenario_2x2: Scenario2x2,
}

impl Position {
    /// Unrealized excursion in bps of entry price at a mark.
    #[inline]
    pub fn unrealized_bps(&self, mid: f64) -> f64 {
        self.side.sign() * (mid - self.entry_px) / self.entry_px * 10_000.0
    }

    #[inline]
    pub fn unrealized_pnl(&self, mid: f64) -> f64 {
        self.side.sign() * (mid - self.entry_px) * self.qty
    }

    #[inline]
    pub fn hold_time_s(&self, now_ms: Millis) -> f64 {
        (now_ms - self.entry_ts_ms) as f64 / 1_000.0
    }
}

/// One executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts_ms: Millis,
    pub symbol: String,
    /// Executed order side (`BUY`/`SELL`).
    pub side: OrderSide,
    pub reason: TradeReason,
    pub exec_px: f64,
    pub qty: f64,
    /// Total fee charged at this execution event.
    pub fee: f64,
    /// Fee decomposition backing `net_pnl` (zero on entries).
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub slippage_bps: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub scenario_2x2: Scenario2x2,
    pub hold_time_s: f64,
    pub is_maker_actual: bool,
    pub maker_probability: f64,
}

/// Per-symbol execution bookkeeping outside the position itself.
#[derive(Debug, Clone, Default)]
struct SymbolBook {
    cooldown_deadline: Millis,
    last_trade_ts: Millis,
    last_direction: i8,
}

/// Simulator counters for the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub entries: u64,
    pub exits: u64,
    pub reverses: u64,
    pub blocked_by_policy: u64,
    pub blocked_by_cooldown: u64,
}

/// Deterministic trade simulator.
pub struct TradeSimulator {
    config: BacktestSection,
    policy: StrategyPolicy,
    fee_engine: FeeEngine,
    slippage: SlippageModel,
    positions: HashMap<String, Position>,
    books: HashMap<String, SymbolBook>,
    last_signal: HashMap<String, SignalV2>,
    trades: Vec<TradeRecord>,
    stats: SimulatorStats,
}

impl TradeSimulator {
    pub fn new(
        config: BacktestSection,
        policy: StrategyPolicy,
        fee_engine: FeeEngine,
        slippage: SlippageModel,
    ) -> Self {
        Self {
            config,
            policy,
            fee_engine,
            slippage,
            positions: HashMap::new(),
            books: HashMap::new(),
            last_signal: HashMap::new(),
            trades: Vec::new(),
            stats: SimulatorStats::default(),
        }
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<TradeRecord> {
        self.trades
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }

    pub fn open_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Mark tick without a signal: drives timeout/stop/take-profit checks.
    pub fn on_mark(&mut self, symbol: &str, ts_ms: Millis, mid: f64) {
        if mid <= 0.0 {
            return;
        }
        self.check_scheduled_exits(symbol, ts_ms, mid);
    }

    /// Process one signal tick.
    pub fn on_signal(&mut self, signal: &SignalV2) {
        let symbol = signal.symbol.clone();
        let mid = signal.mid_px;
        self.last_signal.insert(symbol.clone(), signal.clone());
        if mid <= 0.0 {
            return;
        }

        // Scheduled exits evaluate on every tick, before any entry logic.
        self.check_scheduled_exits(&symbol, signal.ts_ms, mid);

        let (tradeable, reason) = self.policy.should_trade(signal);
        if !tradeable {
            debug!(symbol = %symbol, reason = ?reason, "signal not tradeable");
            self.stats.blocked_by_policy += 1;
            return;
        }
        let Some(side) = self.policy.decide_side(signal) else {
            self.stats.blocked_by_policy += 1;
            return;
        };

        match self.positions.get(&symbol) {
            Some(position) => {
                let opposite = PositionSide::from_order(side) != position.side;
                if !opposite {
                    return; // already positioned this way
                }
                let min_hold = self.config.min_hold_time_sec.unwrap_or(0.0);
                if position.hold_time_s(signal.ts_ms) < min_hold {
                    return;
                }
                if self.config.reverse_on_signal {
                    self.reverse_position(signal, side);
                } else {
                    self.close_position(&symbol, signal.ts_ms, mid, TradeReason::Exit, signal.spread_bps);
                }
            }
            None => {
                let book = self.books.entry(symbol.clone()).or_default();
                let direction = if side == OrderSide::Buy { 1 } else { -1 };
                if signal.ts_ms < book.cooldown_deadline && direction != book.last_direction {
                    self.stats.blocked_by_cooldown += 1;
                    return;
                }
                self.enter_position(signal, side);
            }
        }
    }

    /// Close every open position at end of run. The last signal seen for the
    /// symbol supplies the closing mark and rationale; without one the close
    /// degrades to a timeout at the entry price.
    pub fn close_all(&mut self) {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            match self.last_signal.get(&symbol).cloned() {
                Some(signal) if signal.mid_px > 0.0 => {
                    self.close_position(
                        &symbol,
                        signal.ts_ms,
                        signal.mid_px,
                        TradeReason::RolloverClose,
                        signal.spread_bps,
                    );
                }
                _ => {
                    let position = self.positions[&symbol].clone();
                    self.close_position(
                        &symbol,
                        position.entry_ts_ms,
                        position.entry_px,
                        TradeReason::Timeout,
                        0.0,
                    );
                }
            }
        }
    }

    fn check_scheduled_exits(&mut self, symbol: &str, ts_ms: Millis, mid: f64) {
        let Some(position) = self.positions.get(symbol) else {
            return;
        };
        let hold = position.hold_time_s(ts_ms);
        let unrealized = position.unrealized_bps(mid);
        let spread_bps = self
            .last_signal
            .get(symbol)
            .map(|s| s.spread_bps)
            .unwrap_or(0.0);

        if let Some(max_hold) = self.config.max_hold_time_sec {
            if hold >= max_hold {
                self.close_position(symbol, ts_ms, mid, TradeReason::Timeout, spread_bps);
                return;
            }
        }
        if let Some(stop) = self.config.stop_loss_bps {
            if unrealized <= -stop {
                self.close_position(symbol, ts_ms, mid, TradeReason::StopLoss, spread_bps);
                return;
            }
        }
        if let Some(take) = self.config.take_profit_bps {
            let min_hold = self.config.min_hold_time_sec.unwrap_or(0.0);
            if unrealized >= take && hold >= min_hold {
                self.close_position(symbol, ts_ms, mid, TradeReason::TakeProfit, spread_bps);
            }
        }
    }

    fn enter_position(&mut self, signal: &SignalV2, side: OrderSide) {
        let symbol = &signal.symbol;
        let scenario = signal_scenario(signal);
        let qty_estimate = self.config.notional_per_trade / signal.mid_px;
        let exec_px = self.slippage.exec_price(signal.mid_px, qty_estimate, side);
        let qty = self.config.notional_per_trade / exec_px;
        let notional = qty * exec_px;

        let fee_decision = self.fee_engine.decide(
            notional,
            scenario,
            signal.spread_bps,
            side,
            signal.ts_ms,
            symbol,
        );
        let fee = self.fee_engine.fee_amount(&fee_decision, notional);

        self.positions.insert(
            symbol.clone(),
            Position {
                symbol: symbol.clone(),
                side: PositionSide::from_order(side),
                qty,
                entry_px: exec_px,
                entry_ts_ms: signal.ts_ms,
                notional,
                entry_fee: fee,
                scenario_2x2: scenario,
            },
        );
        let book = self.books.entry(symbol.clone()).or_default();
        book.last_trade_ts = signal.ts_ms;
        book.last_direction = if side == OrderSide::Buy { 1 } else { -1 };

        self.trades.push(TradeRecord {
            ts_ms: signal.ts_ms,
            symbol: symbol.clone(),
            side,
            reason: TradeReason::Entry,
            exec_px,
            qty,
            fee,
            entry_fee: 0.0,
            exit_fee: 0.0,
            slippage_bps: self.slippage.slippage_bps(qty),
            gross_pnl: 0.0,
            net_pnl: 0.0,
            scenario_2x2: scenario,
            hold_time_s: 0.0,
            is_maker_actual: fee_decision.is_maker_actual,
            maker_probability: fee_decision.maker_probability,
        });
        self.stats.entries += 1;
    }

    fn close_position(
        &mut self,
        symbol: &str,
        ts_ms: Millis,
        mid: f64,
        reason: TradeReason,
        spread_bps: f64,
    ) {
        let Some(position) = self.positions.remove(symbol) else {
            return;
        };
        let record = self.build_exit_record(&position, ts_ms, mid, reason, spread_bps, 0.0, None);
        self.finish_exit(symbol, ts_ms, record);
    }

    /// Atomic reversal: close the current position and open the opposite one
    /// in a single trade record sharing one `ts_ms`.
    fn reverse_position(&mut self, signal: &SignalV2, new_side: OrderSide) {
        let symbol = &signal.symbol;
        let Some(position) = self.positions.remove(symbol) else {
            return;
        };
        let scenario = signal_scenario(signal);

        // Open the replacement position first to price its entry fee into
        // the combined record.
        let qty_estimate = self.config.notional_per_trade / signal.mid_px;
        let exec_px = self.slippage.exec_price(signal.mid_px, qty_estimate, new_side);
        let qty = self.config.notional_per_trade / exec_px;
        let notional = qty * exec_px;
        let entry_decision = self.fee_engine.decide(
            notional,
            scenario,
            signal.spread_bps,
            new_side,
            signal.ts_ms,
            symbol,
        );
        let new_entry_fee = self.fee_engine.fee_amount(&entry_decision, notional);

        let record = self.build_exit_record(
            &position,
            signal.ts_ms,
            signal.mid_px,
            TradeReason::Reverse,
            signal.spread_bps,
            new_entry_fee,
            Some(scenario),
        );

        self.positions.insert(
            symbol.clone(),
            Position {
                symbol: symbol.clone(),
                side: PositionSide::from_order(new_side),
                qty,
                entry_px: exec_px,
                entry_ts_ms: signal.ts_ms,
                notional,
                entry_fee: new_entry_fee,
                scenario_2x2: scenario,
            },
        );
        let book = self.books.entry(symbol.clone()).or_default();
        book.last_direction = if new_side == OrderSide::Buy { 1 } else { -1 };
        self.stats.reverses += 1;

        self.finish_exit(symbol, signal.ts_ms, record);
    }

    fn build_exit_record(
        &self,
        position: &Position,
        ts_ms: Millis,
        mid: f64,
        reason: TradeReason,
        spread_bps: f64,
        extra_fee: f64,
        scenario_override: Option<Scenario2x2>,
    ) -> TradeRecord {
        let side = position.side.closing_order();
        let exec_px = self.slippage.exec_price(mid, position.qty, side);
        let exit_notional = position.qty * exec_px;
        let scenario = scenario_override.unwrap_or(position.scenario_2x2);

        let fee_decision =
            self.fee_engine
                .decide(exit_notional, scenario, spread_bps, side, ts_ms, &position.symbol);
        let exit_fee = self.fee_engine.fee_amount(&fee_decision, exit_notional);

        let gross_pnl = position.side.sign() * (exec_px - position.entry_px) * position.qty;
        let net_pnl = gross_pnl - position.entry_fee - exit_fee;

        TradeRecord {
            ts_ms,
            symbol: position.symbol.clone(),
            side,
            reason,
            exec_px,
            qty: position.qty,
            fee: exit_fee + extra_fee,
            entry_fee: position.entry_fee,
            exit_fee,
            slippage_bps: self.slippage.slippage_bps(position.qty),
            gross_pnl,
            net_pnl,
            scenario_2x2: scenario,
            hold_time_s: position.hold_time_s(ts_ms),
            is_maker_actual: fee_decision.is_maker_actual,
            maker_probability: fee_decision.maker_probability,
        }
    }

    fn finish_exit(&mut self, symbol: &str, ts_ms: Millis, record: TradeRecord) {
        let cooldown_source = self.last_signal.get(symbol).map(|s| s.cooldown_ms).unwrap_or(0);
        let book = self.books.entry(symbol.to_string()).or_default();
        book.last_trade_ts = ts_ms;
        book.cooldown_deadline = ts_ms + cooldown_source;
        debug!(
            symbol = %symbol,
            reason = ?record.reason,
            net_pnl = record.net_pnl,
            "position closed"
        );
        self.trades.push(record);
        self.stats.exits += 1;
    }
}

fn signal_scenario(signal: &SignalV2) -> Scenario2x2 {
    signal
        .meta
        .get("scenario_2x2")
        .and_then(|v| v.as_str())
        .map(Scenario2x2::normalize)
        .unwrap_or(Scenario2x2::Unknown)
}

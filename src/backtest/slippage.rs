//! Slippage Models
//!
//! Execution price adjustment for simulated fills. Slippage is priced into
//! the execution price exactly once; nothing downstream subtracts it again.
//!
//! Models: `static` (flat bps), `linear` (bps grows with order quantity
//! relative to a reference size), `piecewise` (bps from a quantity table).

use crate::config::SlippageModelKind;
use crate::strategy::OrderSide;
use serde::{Deserialize, Serialize};

/// Quantity at which the linear model doubles the base slippage.
const LINEAR_REFERENCE_QTY: f64 = 1.0;

/// Piecewise table: `(upper_qty_bound, multiplier)` on the base bps.
const PIECEWISE_TIERS: [(f64, f64); 3] = [(0.1, 0.5), (1.0, 1.0), (f64::INFINITY, 2.0)];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageModel {
    kind: SlippageModelKind,
    base_bps: f64,
}

impl SlippageModel {
    pub fn new(kind: SlippageModelKind, base_bps: f64) -> Self {
        Self { kind, base_bps }
    }

    /// Effective slippage in bps for an order quantity.
    pub fn slippage_bps(&self, qty: f64) -> f64 {
        match self.kind {
            SlippageModelKind::Static => self.base_bps,
            SlippageModelKind::Linear => {
                self.base_bps * (1.0 + qty.abs() / LINEAR_REFERENCE_QTY)
            }
            SlippageModelKind::Piecewise => {
                let multiplier = PIECEWISE_TIERS
                    .iter()
                    .find(|&&(bound, _)| qty.abs() <= bound)
                    .map(|&(_, m)| m)
                    .unwrap_or(1.0);
                self.base_bps * multiplier
            }
        }
    }

    /// Execution price with slippage applied against the trade direction:
    /// buys pay up, sells receive less. Half the spread-equivalent bps is
    /// charged per side.
    pub fn exec_price(&self, mid: f64, qty: f64, side: OrderSide) -> f64 {
        let bps = self.slippage_bps(qty);
        mid * (1.0 + side.sign() * bps / 2.0 / 10_000.0)
    }
}

//! Raw Market Events
//!
//! Canonical input events for the pipeline: trades, best-quote updates and
//! depth snapshots, as recorded by the upstream harvesters in JSONL.
//!
//! Parsing is tolerant by contract: malformed lines are counted and skipped,
//! never fatal. The harvesters label events either with `kind`
//! (`trade`/`bookTicker`/`depth`) or with the legacy `src` field
//! (`aggTrade`/`bookTicker`/`depth`); both are accepted.

use crate::models::Millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggressor {
    Buy,
    Sell,
}

impl Aggressor {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Aggressor::Buy => 1.0,
            Aggressor::Sell => -1.0,
        }
    }
}

/// One price level of a depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

impl Level {
    #[inline]
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Canonical raw event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MarketEvent {
    Trade {
        symbol: String,
        ts_ms: Millis,
        price: f64,
        qty: f64,
        side: Aggressor,
    },
    BookTicker {
        symbol: String,
        ts_ms: Millis,
        best_bid: f64,
        best_ask: f64,
        bid_size: f64,
        ask_size: f64,
    },
    Depth {
        symbol: String,
        ts_ms: Millis,
        bids: Vec<Level>,
        asks: Vec<Level>,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade { symbol, .. }
            | MarketEvent::BookTicker { symbol, .. }
            | MarketEvent::Depth { symbol, .. } => symbol,
        }
    }

    #[inline]
    pub fn ts_ms(&self) -> Millis {
        match self {
            MarketEvent::Trade { ts_ms, .. }
            | MarketEvent::BookTicker { ts_ms, .. }
            | MarketEvent::Depth { ts_ms, .. } => *ts_ms,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            MarketEvent::Trade { .. } => "trade",
            MarketEvent::BookTicker { .. } => "bookTicker",
            MarketEvent::Depth { .. } => "depth",
        }
    }

    /// Parse one JSONL line. Returns None for anything malformed; the caller
    /// counts and moves on.
    pub fn from_json_line(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        Self::from_value(&value)
    }

    /// Parse from an already-decoded JSON object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let symbol = obj.get("symbol")?.as_str()?.to_string();
        if symbol.is_empty() {
            return None;
        }
        let ts_ms = obj.get("ts_ms")?.as_i64()?;
        if ts_ms <= 0 {
            return None;
        }

        let kind = obj
            .get("kind")
            .or_else(|| obj.get("src"))
            .and_then(Value::as_str)?;

        match kind {
            "trade" | "aggTrade" => {
                let price = finite(obj.get("price")?.as_f64()?)?;
                let qty = finite(obj.get("qty")?.as_f64()?)?;
                if price <= 0.0 || qty <= 0.0 {
                    return None;
                }
                let side = match obj.get("side")?.as_str()? {
                    "buy" | "BUY" => Aggressor::Buy,
                    "sell" | "SELL" => Aggressor::Sell,
                    _ => return None,
                };
                Some(MarketEvent::Trade {
                    symbol,
                    ts_ms,
                    price,
                    qty,
                    side,
                })
            }
            "bookTicker" => {
                let best_bid = finite(field_f64(obj, &["best_bid", "bid"])?)?;
                let best_ask = finite(field_f64(obj, &["best_ask", "ask"])?)?;
                if best_bid <= 0.0 || best_ask <= 0.0 {
                    return None;
                }
                let bid_size = field_f64(obj, &["bid_size", "bid_qty"]).unwrap_or(0.0);
                let ask_size = field_f64(obj, &["ask_size", "ask_qty"]).unwrap_or(0.0);
                Some(MarketEvent::BookTicker {
                    symbol,
                    ts_ms,
                    best_bid,
                    best_ask,
                    bid_size,
                    ask_size,
                })
            }
            "depth" => {
                let bids = levels(obj.get("bids")?)?;
                let asks = levels(obj.get("asks")?)?;
                if bids.is_empty() && asks.is_empty() {
                    return None;
                }
                Some(MarketEvent::Depth {
                    symbol,
                    ts_ms,
                    bids,
                    asks,
                })
            }
            _ => None,
        }
    }
}

fn field_f64(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| obj.get(*n).and_then(Value::as_f64))
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Decode `[[price, size], ...]` arrays, skipping malformed entries.
fn levels(value: &Value) -> Option<Vec<Level>> {
    let arr = value.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry.as_array()?;
        let price = pair.first().and_then(Value::as_f64)?;
        let size = pair.get(1).and_then(Value::as_f64)?;
        if !price.is_finite() || !size.is_finite() || price <= 0.0 || size < 0.0 {
            continue;
        }
        out.push(Level::new(price, size));
    }
    Some(out)
}

//! Per-Second Stream Aligner
//!
//! Synchronizes interleaved trade and order-book streams for one symbol into
//! one `AlignedFeatureRow` per integer second, in non-decreasing `second_ts`
//! order. Values are last-value-carry-forward: each row reflects the last
//! observation at or before the end of its second.
//!
//! Strictly single-threaded per symbol; run one `Aligner` per symbol worker.
//!
//! # Failure semantics
//!
//! - Malformed events are counted and skipped upstream (see `events`).
//! - Events more than one second behind the aligner head are dropped and
//!   counted in `oo_drop_count`; the stream never aborts.
//! - Seconds without any observation are emitted with `is_gap_second=1`;
//!   once a run of gap seconds exceeds the configured threshold the rows are
//!   flagged `gap`.

use crate::events::MarketEvent;
use crate::models::{AlignedFeatureRow, Millis, QualityFlag, Secs, MILLIS_PER_SEC};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Aligner counters, snapshotted into the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignerStats {
    pub rows_emitted: u64,
    pub gap_seconds: u64,
    pub oo_drop_count: u64,
    pub price_obs: u64,
    pub book_obs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SourceTrack {
    last_obs_ts: Option<Millis>,
    gap_sum_ms: f64,
    gap_count: u64,
}

impl SourceTrack {
    fn observe(&mut self, ts_ms: Millis) {
        if let Some(prev) = self.last_obs_ts {
            if ts_ms >= prev {
                self.gap_sum_ms += (ts_ms - prev) as f64;
                self.gap_count += 1;
                self.last_obs_ts = Some(ts_ms);
            }
        } else {
            self.last_obs_ts = Some(ts_ms);
        }
    }

    fn avg_gap_ms(&self) -> f64 {
        if self.gap_count == 0 {
            0.0
        } else {
            self.gap_sum_ms / self.gap_count as f64
        }
    }

    fn lag_ms(&self, second_end_ms: Millis) -> i64 {
        self.last_obs_ts
            .map(|ts| (second_end_ms - ts).max(0))
            .unwrap_or(second_end_ms)
    }
}

/// Per-symbol second aligner.
#[derive(Debug)]
pub struct Aligner {
    symbol: String,
    gap_threshold_sec: i64,

    /// Second currently being accumulated.
    head: Option<Secs>,
    /// Consecutive gap seconds ending at the head.
    gap_run: i64,
    /// Whether any observation landed inside the head second.
    observed_in_head: bool,

    price: SourceTrack,
    book: SourceTrack,

    last_trade_px: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,

    stats: AlignerStats,
}

impl Aligner {
    pub fn new(symbol: impl Into<String>, gap_threshold_sec: i64) -> Self {
        Self {
            symbol: symbol.into(),
            gap_threshold_sec,
            head: None,
            gap_run: 0,
            observed_in_head: false,
            price: SourceTrack::default(),
            book: SourceTrack::default(),
            last_trade_px: None,
            best_bid: None,
            best_ask: None,
            stats: AlignerStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn stats(&self) -> &AlignerStats {
        &self.stats
    }

    /// Last trade price carried forward (CVD input for gap rows).
    pub fn last_trade_px(&self) -> Option<f64> {
        self.last_trade_px
    }

    /// Feed one event; returns the rows for every second that closed before
    /// the event's second.
    pub fn on_event(&mut self, event: &MarketEvent) -> Vec<AlignedFeatureRow> {
        debug_assert_eq!(event.symbol(), self.symbol);
        let ts_ms = event.ts_ms();
        let second = ts_ms.div_euclid(MILLIS_PER_SEC);

        let mut closed = Vec::new();
        match self.head {
            None => {
                self.head = Some(second);
                self.observed_in_head = false;
            }
            Some(head) => {
                if second < head - 1 {
                    self.stats.oo_drop_count += 1;
                    debug!(
                        symbol = %self.symbol,
                        ts_ms,
                        head_second = head,
                        "dropping out-of-order event behind aligner head"
                    );
                    return closed;
                }
                // Close every second strictly before the event's second.
                while self.head.is_some_and(|h| h < second) {
                    closed.push(self.close_head());
                }
            }
        }

        self.apply(event);
        if second == self.head.unwrap_or(second) {
            self.observed_in_head = true;
        }
        closed
    }

    /// Close the final in-progress second at end of stream.
    pub fn finish(&mut self) -> Option<AlignedFeatureRow> {
        self.head.is_some().then(|| self.close_head_final())
    }

    fn apply(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::Trade { ts_ms, price, .. } => {
                self.price.observe(*ts_ms);
                self.last_trade_px = Some(*price);
                self.stats.price_obs += 1;
            }
            MarketEvent::BookTicker {
                ts_ms,
                best_bid,
                best_ask,
                ..
            } => {
                self.book.observe(*ts_ms);
                self.best_bid = Some(*best_bid);
                self.best_ask = Some(*best_ask);
                self.stats.book_obs += 1;
            }
            MarketEvent::Depth {
                ts_ms, bids, asks, ..
            } => {
                self.book.observe(*ts_ms);
                // Level-0 stands in when the best-quote stream is missing.
                if let Some(level) = bids.first() {
                    self.best_bid = Some(level.price);
                }
                if let Some(level) = asks.first() {
                    self.best_ask = Some(level.price);
                }
                self.stats.book_obs += 1;
            }
        }
    }

    fn close_head(&mut self) -> AlignedFeatureRow {
        let row = self.build_row();
        self.head = Some(row.second_ts + 1);
        self.observed_in_head = false;
        row
    }

    fn close_head_final(&mut self) -> AlignedFeatureRow {
        let row = self.build_row();
        self.head = None;
        self.observed_in_head = false;
        row
    }

    fn build_row(&mut self) -> AlignedFeatureRow {
        let second = self.head.expect("build_row requires an open second");
        let second_end_ms = second * MILLIS_PER_SEC + (MILLIS_PER_SEC - 1);

        let is_gap = !self.observed_in_head;
        if is_gap {
            self.gap_run += 1;
            self.stats.gap_seconds += 1;
        } else {
            self.gap_run = 0;
        }

        let mut row = AlignedFeatureRow {
            symbol: self.symbol.clone(),
            second_ts: second,
            ts_ms: second_end_ms,
            is_gap_second: is_gap,
            lag_ms_price: self.price.lag_ms(second_end_ms),
            lag_ms_book: self.book.lag_ms(second_end_ms),
            obs_gap_ms_price_avg: self.price.avg_gap_ms(),
            obs_gap_ms_book_avg: self.book.avg_gap_ms(),
            ..Default::default()
        };
        row.lag_sec = row.lag_ms_price.max(row.lag_ms_book) as f64 / 1_000.0;

        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => {
                row.best_bid = bid;
                row.best_ask = ask;
                row.mid = (bid + ask) / 2.0;
                if row.mid > 0.0 {
                    row.spread_bps = (ask - bid) / row.mid * 10_000.0;
                }
            }
            _ => {
                row.reason_codes.insert("missing_book".to_string());
            }
        }
        if self.last_trade_px.is_none() {
            row.reason_codes.insert("missing_trades".to_string());
        }
        if is_gap && self.gap_run > self.gap_threshold_sec {
            row.quality_flags.push(QualityFlag::Gap);
        }

        self.stats.rows_emitted += 1;
        row
    }
}

/// Merge two sorted event streams and align them to seconds.
///
/// Both iterators must be in non-decreasing `ts_ms` order (the recorded
/// partition files are). Ties are broken price-stream first.
pub fn align<P, B>(symbol: &str, gap_threshold_sec: i64, prices: P, book: B) -> Vec<AlignedFeatureRow>
where
    P: IntoIterator<Item = MarketEvent>,
    B: IntoIterator<Item = MarketEvent>,
{
    let mut aligner = Aligner::new(symbol, gap_threshold_sec);
    let mut rows = Vec::new();

    let mut prices = prices.into_iter().peekable();
    let mut book = book.into_iter().peekable();
    loop {
        let take_price = match (prices.peek(), book.peek()) {
            (Some(p), Some(b)) => p.ts_ms() <= b.ts_ms(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let event = if take_price {
            prices.next()
        } else {
            book.next()
        };
        if let Some(event) = event {
            rows.extend(aligner.on_event(&event));
        }
    }
    rows.extend(aligner.finish());
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Aggressor, Level};

    const BASE: Millis = 1_731_470_000_000;

    fn trade(ts_ms: Millis, price: f64) -> MarketEvent {
        MarketEvent::Trade {
            symbol: "BTCUSDT".into(),
            ts_ms,
            price,
            qty: 0.01,
            side: Aggressor::Buy,
        }
    }

    fn ticker(ts_ms: Millis, bid: f64, ask: f64) -> MarketEvent {
        MarketEvent::BookTicker {
            symbol: "BTCUSDT".into(),
            ts_ms,
            best_bid: bid,
            best_ask: ask,
            bid_size: 1.0,
            ask_size: 1.0,
        }
    }

    #[test]
    fn test_rows_per_second_no_duplicates() {
        let mut aligner = Aligner::new("BTCUSDT", 5);
        let mut rows = Vec::new();
        for i in 0..5 {
            rows.extend(aligner.on_event(&ticker(BASE + i * 1000, 99.0, 101.0)));
            rows.extend(aligner.on_event(&trade(BASE + i * 1000 + 100, 100.0)));
        }
        rows.extend(aligner.finish());

        assert_eq!(rows.len(), 5);
        let mut seconds: Vec<Secs> = rows.iter().map(|r| r.second_ts).collect();
        let deduped = seconds.clone();
        seconds.dedup();
        assert_eq!(seconds, deduped, "duplicate (symbol, second_ts) rows");
        assert!((rows[0].mid - 100.0).abs() < 1e-9);
        assert!((rows[0].spread_bps - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_gap_second_carry_forward() {
        let mut aligner = Aligner::new("BTCUSDT", 0);
        let mut rows = Vec::new();
        rows.extend(aligner.on_event(&ticker(BASE, 99.0, 101.0)));
        // Skip two seconds
        rows.extend(aligner.on_event(&ticker(BASE + 3000, 100.0, 102.0)));
        rows.extend(aligner.finish());

        assert_eq!(rows.len(), 4);
        assert!(!rows[0].is_gap_second);
        assert!(rows[1].is_gap_second);
        assert!(rows[2].is_gap_second);
        // Carried-forward quotes from the first second
        assert!((rows[1].mid - 100.0).abs() < 1e-9);
        // Gap threshold 0: flagged immediately
        assert!(rows[1].quality_flags.contains(&QualityFlag::Gap));
        assert_eq!(aligner.stats().gap_seconds, 2);
    }

    #[test]
    fn test_lag_accounting() {
        let mut aligner = Aligner::new("BTCUSDT", 5);
        let mut rows = Vec::new();
        rows.extend(aligner.on_event(&ticker(BASE + 200, 99.0, 101.0)));
        rows.extend(aligner.on_event(&ticker(BASE + 1000, 99.0, 101.0)));
        rows.extend(aligner.finish());

        // First second closed with last book obs at +200ms, end of second +999ms
        assert_eq!(rows[0].lag_ms_book, 799);
        // No trades at all: price lag is the whole epoch-to-end span
        assert!(rows[0].lag_ms_price > rows[0].lag_ms_book);
        assert!(rows[0].reason_codes.contains("missing_trades"));
    }

    #[test]
    fn test_out_of_order_drop() {
        let mut aligner = Aligner::new("BTCUSDT", 5);
        let _ = aligner.on_event(&ticker(BASE + 5000, 99.0, 101.0));
        // 5 seconds behind the head: dropped
        let rows = aligner.on_event(&ticker(BASE, 1.0, 2.0));
        assert!(rows.is_empty());
        assert_eq!(aligner.stats().oo_drop_count, 1);
        // Quotes unchanged by the dropped event
        let row = aligner.finish().unwrap();
        assert!((row.mid - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_depth_level0_fallback() {
        let mut aligner = Aligner::new("BTCUSDT", 5);
        let depth = MarketEvent::Depth {
            symbol: "BTCUSDT".into(),
            ts_ms: BASE,
            bids: vec![Level::new(70321.4, 10.5), Level::new(70321.3, 8.2)],
            asks: vec![Level::new(70321.6, 11.2)],
        };
        let _ = aligner.on_event(&depth);
        let row = aligner.finish().unwrap();
        assert!((row.best_bid - 70321.4).abs() < 1e-9);
        assert!((row.best_ask - 70321.6).abs() < 1e-9);
        assert!(row.spread_bps > 0.0);
    }

    #[test]
    fn test_align_merges_sorted_streams() {
        let prices = vec![trade(BASE + 100, 100.0), trade(BASE + 1100, 101.0)];
        let book = vec![ticker(BASE, 99.0, 101.0), ticker(BASE + 1000, 100.0, 102.0)];
        let rows = align("BTCUSDT", 5, prices, book);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].second_ts < rows[1].second_ts);
        assert!(rows.iter().all(|r| !r.is_gap_second));
    }
}

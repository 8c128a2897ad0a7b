//! Order Flow Imbalance
//!
//! Level-weighted signed size change over the top-N book levels. A bid size
//! increase is buying pressure (+), a bid decrease is selling pressure (-);
//! ask changes contribute with the opposite sign. Updates accumulate into a
//! rolling window sum which is z-scored over a longer normalization window
//! and then EMA-smoothed.

use crate::config::OfiConfig;
use crate::events::Level;
use crate::features::rolling::{RollingSum, RollingStats};
use crate::models::Millis;

/// Per-symbol OFI state.
#[derive(Debug)]
pub struct OfiState {
    weights: Vec<f64>,
    burst_coalesce_ms: i64,
    window: RollingSum,
    zstats: RollingStats,
    ema_alpha: f64,
    ema_z: Option<f64>,

    prev_bids: Vec<Level>,
    prev_asks: Vec<Level>,
    last_depth_ts: Option<Millis>,
}

impl OfiState {
    pub fn new(config: &OfiConfig, burst_coalesce_ms: i64) -> Self {
        Self {
            weights: config.effective_weights(),
            burst_coalesce_ms,
            window: RollingSum::new(config.window_ms),
            zstats: RollingStats::new(config.zscore_window),
            ema_alpha: config.ema_alpha,
            ema_z: None,
            prev_bids: Vec::new(),
            prev_asks: Vec::new(),
            last_depth_ts: None,
        }
    }

    /// Apply one depth update and fold the imbalance into the rolling state.
    pub fn on_depth(&mut self, ts_ms: Millis, bids: &[Level], asks: &[Level]) {
        let imbalance = self.weighted_delta(bids, asks);

        let in_burst = self
            .last_depth_ts
            .is_some_and(|prev| self.burst_coalesce_ms > 0 && ts_ms - prev < self.burst_coalesce_ms);
        if in_burst {
            // Sub-second burst: the latest update supersedes the previous one.
            self.window.replace_last(ts_ms, imbalance);
        } else {
            self.window.push(ts_ms, imbalance);
        }
        self.last_depth_ts = Some(ts_ms);

        self.prev_bids = bids.iter().take(self.weights.len()).copied().collect();
        self.prev_asks = asks.iter().take(self.weights.len()).copied().collect();

        let window_sum = self.window.sum();
        self.zstats.push(ts_ms, window_sum);
        let z = self.zstats.zscore(window_sum);
        self.ema_z = Some(match self.ema_z {
            Some(prev) => self.ema_alpha * z + (1.0 - self.ema_alpha) * prev,
            None => z,
        });
    }

    fn weighted_delta(&self, bids: &[Level], asks: &[Level]) -> f64 {
        let mut total = 0.0;
        for (idx, weight) in self.weights.iter().enumerate() {
            let bid_now = bids.get(idx).map_or(0.0, |l| l.size);
            let bid_prev = self.prev_bids.get(idx).map_or(0.0, |l| l.size);
            let ask_now = asks.get(idx).map_or(0.0, |l| l.size);
            let ask_prev = self.prev_asks.get(idx).map_or(0.0, |l| l.size);
            total += weight * ((bid_now - bid_prev) - (ask_now - ask_prev));
        }
        total
    }

    /// EMA-smoothed z-score of the rolling window sum.
    #[inline]
    pub fn z(&self) -> f64 {
        self.ema_z.unwrap_or(0.0)
    }

    /// Normalization samples accumulated so far (warmup gate input).
    #[inline]
    pub fn sample_count(&self) -> usize {
        self.zstats.len()
    }

    /// Whether any depth update landed in the rolling window lately.
    pub fn has_recent_depth(&self, now_ms: Millis, staleness_ms: i64) -> bool {
        self.last_depth_ts
            .is_some_and(|ts| now_ms - ts <= staleness_ms)
    }

    /// Evict stale window samples without a new observation (gap seconds).
    pub fn advance_to(&mut self, now_ms: Millis) {
        self.window.evict(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(sizes: &[f64]) -> Vec<Level> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| Level::new(100.0 - i as f64 * 0.1, s))
            .collect()
    }

    fn config() -> OfiConfig {
        OfiConfig {
            window_ms: 5_000,
            zscore_window: 30_000,
            levels: 3,
            weights: vec![0.5, 0.3, 0.2],
            ema_alpha: 1.0, // no smoothing: z is directly observable
        }
    }

    #[test]
    fn test_bid_add_is_positive_pressure() {
        let mut ofi = OfiState::new(&config(), 0);
        ofi.on_depth(0, &levels(&[10.0, 8.0, 6.0]), &levels(&[10.0, 8.0, 6.0]));
        // Bid size grows at level 0, ask shrinks: both push positive
        for i in 1..20 {
            ofi.on_depth(
                i * 250,
                &levels(&[10.0 + i as f64, 8.0, 6.0]),
                &levels(&[(10.0 - 0.2 * i as f64).max(0.0), 8.0, 6.0]),
            );
        }
        assert!(ofi.z() > 0.0, "z = {}", ofi.z());
    }

    #[test]
    fn test_symmetric_book_is_flat() {
        let mut ofi = OfiState::new(&config(), 0);
        for i in 0..20 {
            // Identical bid/ask changes cancel exactly
            let side = levels(&[10.0 + i as f64, 8.0, 6.0]);
            ofi.on_depth(i * 250, &side, &side);
        }
        assert_eq!(ofi.z(), 0.0);
    }

    #[test]
    fn test_burst_coalescing_keeps_last() {
        let mut burst = OfiState::new(&config(), 200);
        let mut plain = OfiState::new(&config(), 0);
        let flat = levels(&[10.0, 8.0, 6.0]);
        let bump = levels(&[15.0, 8.0, 6.0]);
        for state in [&mut burst, &mut plain] {
            state.on_depth(0, &flat, &flat);
            // Two updates 50ms apart inside one second
            state.on_depth(1_000, &bump, &flat);
            state.on_depth(1_050, &bump, &flat);
        }
        // The coalescing state dropped the first burst contribution
        assert!(burst.sample_count() < plain.sample_count() || burst.z() <= plain.z());
    }

    #[test]
    fn test_warmup_counter() {
        let mut ofi = OfiState::new(&config(), 0);
        assert_eq!(ofi.sample_count(), 0);
        let side = levels(&[10.0, 8.0, 6.0]);
        ofi.on_depth(0, &side, &side);
        assert_eq!(ofi.sample_count(), 1);
    }
}

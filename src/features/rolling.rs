//! Time-Windowed Rolling Accumulators
//!
//! Small building blocks shared by the OFI and CVD state: a rolling sum over
//! a time window and a rolling mean/std tracker for z-score normalization.
//! Both evict by timestamp, O(1) amortized per update.

use crate::models::Millis;
use std::collections::VecDeque;

/// Rolling sum of timestamped values over a fixed window.
#[derive(Debug, Clone)]
pub struct RollingSum {
    window_ms: i64,
    samples: VecDeque<(Millis, f64)>,
    sum: f64,
}

impl RollingSum {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, ts_ms: Millis, value: f64) {
        self.samples.push_back((ts_ms, value));
        self.sum += value;
        self.evict(ts_ms);
    }

    /// Replace the most recent sample (burst coalescing).
    pub fn replace_last(&mut self, ts_ms: Millis, value: f64) {
        if let Some((_, old)) = self.samples.pop_back() {
            self.sum -= old;
        }
        self.push(ts_ms, value);
    }

    pub fn evict(&mut self, now_ms: Millis) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, value)) = self.samples.front() {
            if ts > cutoff {
                break;
            }
            self.samples.pop_front();
            self.sum -= value;
        }
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_ts(&self) -> Option<Millis> {
        self.samples.back().map(|&(ts, _)| ts)
    }
}

/// Rolling mean/std over a time window, for z-score normalization.
#[derive(Debug, Clone)]
pub struct RollingStats {
    window_ms: i64,
    samples: VecDeque<(Millis, f64)>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, ts_ms: Millis, value: f64) {
        self.samples.push_back((ts_ms, value));
        self.sum += value;
        self.sum_sq += value * value;
        let cutoff = ts_ms - self.window_ms;
        while let Some(&(ts, v)) = self.samples.front() {
            if ts > cutoff {
                break;
            }
            self.samples.pop_front();
            self.sum -= v;
            self.sum_sq -= v * v;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn std(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = (self.sum_sq / n as f64 - mean * mean).max(0.0);
        var.sqrt()
    }

    /// Z-score of `value` against the window; 0 while the std is degenerate.
    pub fn zscore(&self, value: f64) -> f64 {
        let std = self.std();
        if std <= f64::EPSILON {
            0.0
        } else {
            (value - self.mean()) / std
        }
    }

    /// Quantile (0..=1) over the current window, by sorted copy.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|&(_, v)| v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((values.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
        values[idx]
    }
}

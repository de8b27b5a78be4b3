// =============================================================================
// Tick Imbalance — tick-rule buy/sell classification in 1-second buckets
// =============================================================================
//
// Each trade is classified by the tick rule: uptick = buy-initiated,
// downtick = sell-initiated, zero-tick inherits the last non-zero direction.
// Traded value is accumulated into per-second buckets so memory is
// O(window) rather than O(ticks).
// =============================================================================

use std::collections::VecDeque;

/// Hard cap on retained second-buckets (oldest auto-evicted).
const BUCKET_CAPACITY: usize = 300;

/// Accepted window range in seconds.
const WINDOW_MIN_SEC: u64 = 60;
const WINDOW_MAX_SEC: u64 = 120;

/// One second of classified traded value.
#[derive(Debug, Clone, Default)]
struct SecondBucket {
    ts_sec: i64,
    buy_val: f64,
    sell_val: f64,
}

/// Rolling tick-rule imbalance calculator.
#[derive(Debug, Clone)]
pub struct TickImbalance {
    window_sec: i64,
    buckets: VecDeque<SecondBucket>,
    last_px: Option<f64>,
    last_dir: i8,
}

impl Default for TickImbalance {
    fn default() -> Self {
        Self::new(90)
    }
}

impl TickImbalance {
    /// Create with a window clamped to the accepted 60–120 s range.
    pub fn new(window_sec: u64) -> Self {
        Self {
            window_sec: window_sec.clamp(WINDOW_MIN_SEC, WINDOW_MAX_SEC) as i64,
            buckets: VecDeque::with_capacity(BUCKET_CAPACITY),
            last_px: None,
            last_dir: 0,
        }
    }

    /// Configured window in seconds.
    pub fn window_sec(&self) -> i64 {
        self.window_sec
    }

    /// Feed one trade. Non-positive price or volume is ignored.
    pub fn update(&mut self, ts: f64, price: f64, volume: f64) {
        if price <= 0.0 || volume <= 0.0 {
            return;
        }

        let ts_sec = ts.floor() as i64;
        let val = price * volume;

        // Tick-rule direction.
        let dir = match self.last_px {
            None => 0,
            Some(last) if price > last => 1,
            Some(last) if price < last => -1,
            Some(_) => self.last_dir,
        };
        if dir != 0 {
            self.last_dir = dir;
        }
        self.last_px = Some(price);

        if self.buckets.back().map(|b| b.ts_sec) != Some(ts_sec) {
            self.buckets.push_back(SecondBucket {
                ts_sec,
                ..Default::default()
            });
            while self.buckets.len() > BUCKET_CAPACITY {
                self.buckets.pop_front();
            }
        }

        let bucket = self.buckets.back_mut().expect("bucket just pushed");
        if dir > 0 {
            bucket.buy_val += val;
        } else if dir < 0 {
            bucket.sell_val += val;
        }
    }

    /// Imbalance ratio `(buy - sell) / (buy + sell)` over the trailing
    /// window, in `[-1, +1]`. Returns 0 when the window holds no classified
    /// value.
    pub fn compute(&self, now_ts: f64) -> f64 {
        let cutoff = now_ts.floor() as i64 - self.window_sec;
        let mut buy = 0.0;
        let mut sell = 0.0;

        for bucket in self.buckets.iter().rev() {
            if bucket.ts_sec < cutoff {
                break;
            }
            buy += bucket.buy_val;
            sell += bucket.sell_val;
        }

        let total = buy + sell;
        if total <= 0.0 {
            0.0
        } else {
            (buy - sell) / total
        }
    }

    /// Clear all state (session reset).
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.last_px = None;
        self.last_dir = 0;
    }
}

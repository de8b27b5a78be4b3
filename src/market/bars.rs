// =============================================================================
// Bar Aggregator — merges ticks into fixed-minute OHLCV bars
// =============================================================================
//
// The aggregator keeps one in-progress bar plus a bounded ring of completed
// bars (oldest evicted first). Ticks whose bucket precedes the current bar
// are dropped — no re-ordering is attempted.
// =============================================================================

use std::collections::VecDeque;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. `ts` is the bucket start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Truncate `ts` down to the start of its `interval_min` bucket.
fn bucket_start(ts: NaiveDateTime, interval_min: u32) -> NaiveDateTime {
    let interval = interval_min.max(1);
    ts.with_minute((ts.minute() / interval) * interval)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Aggregates ticks into fixed-minute bars with bounded history.
#[derive(Debug, Clone)]
pub struct BarAggregator {
    interval_min: u32,
    max_bars: usize,
    current: Option<Bar>,
    completed: VecDeque<Bar>,
}

impl BarAggregator {
    /// Default completed-bar history depth.
    pub const DEFAULT_MAX_BARS: usize = 500;

    pub fn new(interval_min: u32) -> Self {
        Self::with_capacity(interval_min, Self::DEFAULT_MAX_BARS)
    }

    pub fn with_capacity(interval_min: u32, max_bars: usize) -> Self {
        Self {
            interval_min: interval_min.max(1),
            max_bars: max_bars.max(1),
            current: None,
            completed: VecDeque::with_capacity(max_bars.max(1)),
        }
    }

    /// Feed one tick. Returns the bar that was completed by this tick, if a
    /// bucket roll occurred.
    pub fn update_tick(&mut self, ts: NaiveDateTime, price: f64, volume: f64) -> Option<Bar> {
        let start = bucket_start(ts, self.interval_min);

        match &mut self.current {
            None => {
                self.current = Some(Bar {
                    ts: start,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
                None
            }
            Some(bar) if start > bar.ts => {
                let finished = bar.clone();
                self.completed.push_back(finished.clone());
                while self.completed.len() > self.max_bars {
                    self.completed.pop_front();
                }
                self.current = Some(Bar {
                    ts: start,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
                Some(finished)
            }
            Some(bar) if start < bar.ts => None, // stale tick, dropped
            Some(bar) => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += volume;
                None
            }
        }
    }

    /// The most recent `n` completed bars, oldest first (all when `n == 0`).
    pub fn completed_bars(&self, n: usize) -> Vec<Bar> {
        let len = self.completed.len();
        let skip = if n == 0 { 0 } else { len.saturating_sub(n) };
        self.completed.iter().skip(skip).cloned().collect()
    }

    /// The most recent completed bar, if any.
    pub fn last_completed(&self) -> Option<&Bar> {
        self.completed.back()
    }

    /// The in-progress bar, if any.
    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Number of completed bars held.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Drop all state (session reset).
    pub fn reset(&mut self) {
        self.current = None;
        self.completed.clear();
    }
}

/// Batch re-aggregation of already-built bars into a larger timeframe.
///
/// Input bars must be in chronological order; each is merged into the
/// `target_minutes` bucket its timestamp falls in.
pub fn aggregate_bars(bars: &[Bar], target_minutes: u32) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::new();
    let mut current: Option<Bar> = None;

    for bar in bars {
        let start = bucket_start(bar.ts, target_minutes);
        match &mut current {
            Some(cur) if start <= cur.ts => {
                cur.high = cur.high.max(bar.high);
                cur.low = cur.low.min(bar.low);
                cur.close = bar.close;
                cur.volume += bar.volume;
            }
            _ => {
                if let Some(done) = current.take() {
                    out.push(done);
                }
                current = Some(Bar {
                    ts: start,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                });
            }
        }
    }

    if let Some(done) = current {
        out.push(done);
    }
    out
}

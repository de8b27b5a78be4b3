// =============================================================================
// Rolling Indicators — SMA, EMA, ATR, z-score, percentile rank
// =============================================================================
//
// Batch functions return finite sequences (empty when the input is shorter
// than the period). Rolling variants admit one observation at a time and
// return `None` until the window is fully warmed.
//
// ATR uses the classic true-range definition with Wilder's smoothing:
//   TR  = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use std::collections::VecDeque;

/// Simple moving average sequence. Element `i` covers `values[i..i+period]`.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut sum: f64 = values[..period].iter().sum();
    out.push(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out.push(sum / period as f64);
    }
    out
}

/// Exponential moving average sequence, seeded with the SMA of the first
/// `period` values, then smoothed with `k = 2 / (period + 1)`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out.push(seed);
    let mut prev = seed;
    for &v in &values[period..] {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Most recent ATR over `(high, low, prev_close)` triples using Wilder's
/// smoothing. `None` until at least `period` triples are available or when
/// any intermediate value is non-finite.
pub fn atr(triples: &[(f64, f64, f64)], period: usize) -> Option<f64> {
    if period == 0 || triples.len() < period {
        return None;
    }

    let tr = |&(high, low, prev_close): &(f64, f64, f64)| -> f64 {
        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        hl.max(hc).max(lc)
    };

    let seed: f64 = triples[..period].iter().map(tr).sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for t in &triples[period..] {
        atr = (atr * (period_f - 1.0) + tr(t)) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }
    Some(atr)
}

/// Z-score of `x` within `sample`: `(x - mean) / stddev`. `None` when the
/// sample has fewer than two elements or zero variance.
pub fn zscore(sample: &[f64], x: f64) -> Option<f64> {
    if sample.len() < 2 {
        return None;
    }
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    let var = sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    if std <= 0.0 || !std.is_finite() {
        return None;
    }
    Some((x - mean) / std)
}

/// Percentile rank of `x` within `sample`: the fraction of sample values
/// `<= x` (ties counted), scaled to `[0, 100]`. Returns 0 for an empty
/// sample.
pub fn percentile_rank(sample: &[f64], x: f64) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let below = sample.iter().filter(|&&v| v <= x).count();
    below as f64 / sample.len() as f64 * 100.0
}

// ---------------------------------------------------------------------------
// Rolling variants
// ---------------------------------------------------------------------------

/// Incremental simple moving average over a fixed window.
#[derive(Debug, Clone)]
pub struct RollingSma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl RollingSma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1) + 1),
            sum: 0.0,
        }
    }

    /// Push one observation; returns the window mean once warmed.
    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.value()
    }

    /// Current window mean, or `None` until the window is full.
    pub fn value(&self) -> Option<f64> {
        if self.window.len() < self.period {
            None
        } else {
            Some(self.sum / self.period as f64)
        }
    }
}

/// Incremental Wilder ATR fed one completed bar at a time.
#[derive(Debug, Clone)]
pub struct RollingAtr {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
    atr: Option<f64>,
}

impl RollingAtr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_sum: 0.0,
            seed_count: 0,
            atr: None,
        }
    }

    /// Push one completed bar; returns the smoothed ATR once `period` true
    /// ranges have been observed. The first bar only records its close (no
    /// previous close exists for a true range yet).
    pub fn update_bar(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let prev_close = match self.prev_close {
            Some(pc) => pc,
            None => {
                self.prev_close = Some(close);
                return None;
            }
        };
        self.prev_close = Some(close);

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        match self.atr {
            Some(prev) => {
                let p = self.period as f64;
                self.atr = Some((prev * (p - 1.0) + tr) / p);
            }
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.atr = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.atr
    }

    /// Current ATR, or `None` until warmed.
    pub fn value(&self) -> Option<f64> {
        self.atr
    }
}

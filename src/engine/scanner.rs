// =============================================================================
// Premarket Scanner — trend anchor + 09:15 value-surge scan
// =============================================================================
//
// The daily trend anchor qualifies symbols whose close sits above a rising
// SMA20 that itself sits above the SMA60. At 09:15 the value-surge scan
// ranks trend-qualified symbols by 15-minute traded value against their
// baseline, seeds the opening range and early RVol from REST bars, and
// promotes the top N to CANDIDATE.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::kis::client::KisClient;
use crate::market::bars::Bar;
use crate::rate::budget::EndpointClass;
use crate::rate::shared::SharedRateBudget;
use crate::types::KisError;

use super::params::GAP_SKIP;
use super::state::{FsmState, SymbolState};

/// Spacing between retries when the chart budget is exhausted.
const RATE_LIMIT_SLEEP: Duration = Duration::from_millis(500);

/// Minute-bar provider. Seam for tests.
pub trait ChartSource {
    async fn minute_bars(&self, ticker: &str, minutes: u32) -> Result<Vec<Bar>, KisError>;
}

impl ChartSource for KisClient {
    async fn minute_bars(&self, ticker: &str, minutes: u32) -> Result<Vec<Bar>, KisError> {
        self.get_minute_bars(ticker, minutes).await
    }
}

/// Apply the daily trend anchor from daily bars (oldest first; at least 60
/// required). Stores SMA20/60 and the previous close; sets `trend_ok` when
/// close > SMA20, the SMA20 slope is non-negative, and SMA20 ≥ SMA60.
pub fn apply_trend_anchor(
    states: &mut HashMap<String, SymbolState>,
    daily: &HashMap<String, Vec<Bar>>,
) {
    for (ticker, bars) in daily {
        let Some(state) = states.get_mut(ticker) else {
            continue;
        };
        if bars.len() < 60 {
            continue;
        }

        let closes: Vec<f64> = bars[bars.len() - 60..].iter().map(|b| b.close).collect();
        state.sma60 = closes.iter().sum::<f64>() / 60.0;
        state.sma20 = closes[40..].iter().sum::<f64>() / 20.0;
        state.prev_close = closes[59];

        let sma20_prev = closes[39..59].iter().sum::<f64>() / 20.0;
        let slope_ok = state.sma20 >= sma20_prev;

        state.trend_ok =
            closes[59] > state.sma20 && slope_ok && state.sma20 >= state.sma60;
    }
}

/// Fetch minute bars under the shared CHART budget, retrying briefly when
/// rate-limited, with a final unbudgeted attempt.
async fn budgeted_minute_bars<C: ChartSource>(
    api: &C,
    budget: Option<&SharedRateBudget>,
    strategy_id: &str,
    ticker: &str,
    minutes: u32,
) -> Result<Vec<Bar>, KisError> {
    if let Some(budget) = budget {
        for attempt in 0..3u32 {
            if budget.try_consume(EndpointClass::Chart, strategy_id, 1.0) {
                return api.minute_bars(ticker, minutes).await;
            }
            tokio::time::sleep(RATE_LIMIT_SLEEP * (attempt + 1)).await;
        }
    }
    api.minute_bars(ticker, minutes).await
}

/// 09:15 value-surge scan. Returns the promoted tickers, best first.
#[allow(clippy::too_many_arguments)]
pub async fn scan_value_surge<C: ChartSource>(
    api: &C,
    universe: &[String],
    baseline_15m: &HashMap<String, f64>,
    states: &mut HashMap<String, SymbolState>,
    min_surge: f64,
    top_n: usize,
    budget: Option<&SharedRateBudget>,
    strategy_id: &str,
) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = Vec::new();

    for ticker in universe {
        let Some(state) = states.get_mut(ticker) else {
            continue;
        };
        if !state.trend_ok {
            continue;
        }

        let bars = match budgeted_minute_bars(api, budget, strategy_id, ticker, 15).await {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => continue,
            Err(e) => {
                debug!(ticker = %ticker, error = %e, "scan chart fetch failed");
                continue;
            }
        };

        let value15: f64 = bars.iter().map(|b| b.close * b.volume).sum();
        let base = baseline_15m.get(ticker).copied().unwrap_or(0.0);
        if base <= 0.0 {
            continue;
        }

        let surge = value15 / base;
        if surge < min_surge {
            continue;
        }

        // Gap skip: a 5%+ open gap against the previous close disqualifies.
        let open_px = bars[0].open;
        if state.prev_close > 0.0 && open_px > 0.0 {
            let gap_pct = (open_px - state.prev_close).abs() / state.prev_close;
            if gap_pct >= GAP_SKIP {
                debug!(ticker = %ticker, gap_pct, "gap too wide — skipped");
                continue;
            }
        }

        // Seed the opening range from the 09:00–09:15 REST bars.
        state.or_high = bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        state.or_low = bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

        // Seed early RVol from the last completed bar.
        if state.avg_1m_vol > 0.0 {
            let last_vol = bars[bars.len() - 1].volume;
            if last_vol > 0.0 {
                state.rvol_1m = last_vol / state.avg_1m_vol;
            }
        }

        // Approximate the last 5 minutes of traded value from the tail.
        let tail_start = bars.len().saturating_sub(5);
        state.last_5m_value = bars[tail_start..].iter().map(|b| b.close * b.volume).sum();

        state.value15 = value15;
        state.surge = surge;
        scored.push((ticker.clone(), value15));
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let top: Vec<String> = scored.into_iter().take(top_n).map(|(t, _)| t).collect();

    for ticker in &top {
        if let Some(state) = states.get_mut(ticker) {
            state.fsm = FsmState::Candidate;
            info!(ticker = %ticker, surge = state.surge, "value-surge candidate");
        }
    }
    top
}

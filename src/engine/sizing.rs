// =============================================================================
// Position Sizing — risk parity × quality score × overlays
// =============================================================================
//
// Base size risks `BASE_RISK_PCT` of equity against the structural stop,
// then scales by the quality multiplier, the time-decay multiplier, and the
// program-regime multiplier, and finally saturates under the liquidity and
// NAV caps.
// =============================================================================

use chrono::NaiveTime;

use crate::config::StrategySwitches;

use super::gates::{log_would_block, min_surge_threshold, minutes_since_0916};
use super::params::{
    BASE_RISK_PCT, LIQ_CAP_PCT_5M_VALUE, NAV_CAP_PCT, QUALITY_THRESHOLD_HIGH,
    QUALITY_THRESHOLD_LOW, QUALITY_THRESHOLD_MED, RVOL_MIN,
};
use super::state::SymbolState;

/// Inputs the quality score needs from outside the symbol state.
#[derive(Debug, Clone, Copy)]
pub struct QualityContext {
    pub now: NaiveTime,
    /// Leader breadth at or above threshold.
    pub regime_breadth_ok: bool,
    /// Market is NOT chopping.
    pub not_chop: bool,
}

/// Quality score in [0, 100].
///
/// Components: surge excess (0–20), RVol excess (0–15), tick imbalance
/// (0–15), spread (0–10), acceptance cleanliness (0–10), regime breadth
/// (0/15 binary), not-chop (0/15 binary).
pub fn quality_score(s: &SymbolState, switches: &StrategySwitches, ctx: &QualityContext) -> f64 {
    let mut score = 0.0;

    let minutes = minutes_since_0916(ctx.now);
    let surge_excess = s.surge - min_surge_threshold(minutes, switches.min_surge_slope);
    score += (surge_excess * 10.0).clamp(0.0, 20.0);

    let rvol_excess = s.rvol_1m - RVOL_MIN;
    score += (rvol_excess * 10.0).clamp(0.0, 15.0);

    score += ((s.imb + 0.1) * 50.0).clamp(0.0, 15.0);

    score += (10.0 - s.spread_pct * 500.0).clamp(0.0, 10.0);

    // Acceptance cleanliness: a shallow pullback that held near the OR high
    // scores full points; anything deeper than ~2.5% scores none.
    if s.or_high > 0.0 && s.retest_low > 0.0 && s.retest_low < s.or_high {
        let pullback_depth = (s.or_high - s.retest_low) / s.or_high;
        score += (10.0 - pullback_depth * 400.0).clamp(0.0, 10.0);
    }

    if ctx.regime_breadth_ok {
        score += 15.0;
    }
    if ctx.not_chop {
        score += 15.0;
    }

    score.clamp(0.0, 100.0)
}

/// Quality multiplier keyed on the score: {0, 0.5, 1.0, 1.5} at thresholds
/// {switch minimum, 60, 80}.
pub fn quality_multiplier(
    s: &SymbolState,
    switches: &StrategySwitches,
    ctx: &QualityContext,
) -> f64 {
    let score = quality_score(s, switches, ctx);
    let min_threshold = switches.quality_min as f64;

    if score < min_threshold {
        return 0.0;
    }
    if min_threshold < QUALITY_THRESHOLD_LOW && score < QUALITY_THRESHOLD_LOW {
        log_would_block(&s.code, "QUALITY_SCORE", score, QUALITY_THRESHOLD_LOW);
    }

    if score < QUALITY_THRESHOLD_MED {
        0.5
    } else if score < QUALITY_THRESHOLD_HIGH {
        1.0
    } else {
        1.5
    }
}

/// Risk-parity base quantity scaled by the three multipliers. Returns zero
/// when the stop distance is degenerate or quality disqualifies the setup.
#[allow(clippy::too_many_arguments)]
pub fn compute_qty(
    s: &SymbolState,
    switches: &StrategySwitches,
    ctx: &QualityContext,
    equity: f64,
    entry_px: f64,
    stop_px: f64,
    program_mult: f64,
    time_mult: f64,
) -> i64 {
    let risk_krw = equity * BASE_RISK_PCT;
    let risk_per_share = entry_px - stop_px;
    if risk_per_share <= 0.0 {
        return 0;
    }

    let qty_base = (risk_krw / risk_per_share) as i64;
    let qmult = quality_multiplier(s, switches, ctx);
    if qmult <= 0.0 {
        return 0;
    }

    ((qty_base as f64 * qmult * time_mult * program_mult) as i64).max(0)
}

/// Cap quantity at `LIQ_CAP_PCT_5M_VALUE` of the latest completed
/// 5-minute traded value.
pub fn apply_liquidity_cap(qty: i64, entry_px: f64, last_5m_value: f64) -> i64 {
    if last_5m_value <= 0.0 {
        return qty;
    }
    let max_notional = LIQ_CAP_PCT_5M_VALUE * last_5m_value;
    let max_qty = (max_notional / entry_px.max(1.0)) as i64;
    qty.min(max_qty)
}

/// Cap quantity at `NAV_CAP_PCT` of equity.
pub fn apply_nav_cap(qty: i64, entry_px: f64, equity: f64) -> i64 {
    if equity <= 0.0 || entry_px <= 0.0 {
        return qty;
    }
    let max_qty = (NAV_CAP_PCT * equity / entry_px) as i64;
    qty.min(max_qty)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn ctx() -> QualityContext {
        QualityContext {
            now: t(9, 20),
            regime_breadth_ok: true,
            not_chop: true,
        }
    }

    /// A clean high-quality setup.
    fn strong_state() -> SymbolState {
        let mut s = SymbolState::new("005930", "IT");
        s.surge = 6.0;
        s.rvol_1m = 4.0;
        s.imb = 0.3;
        s.spread_pct = 0.001;
        s.or_high = 10_000.0;
        s.retest_low = 9_950.0; // 0.5% pullback
        s
    }

    #[test]
    fn strong_setup_scores_high() {
        let score = quality_score(&strong_state(), &StrategySwitches::default(), &ctx());
        assert!(score >= 80.0, "expected >= 80, got {score}");
        assert_eq!(
            quality_multiplier(&strong_state(), &StrategySwitches::default(), &ctx()),
            1.5
        );
    }

    #[test]
    fn weak_setup_scores_zero_multiplier() {
        let mut s = SymbolState::new("005930", "IT");
        s.surge = 0.0;
        s.rvol_1m = 0.0;
        s.imb = -0.5;
        s.spread_pct = 0.05;
        let weak_ctx = QualityContext {
            now: t(9, 20),
            regime_breadth_ok: false,
            not_chop: false,
        };
        let score = quality_score(&s, &StrategySwitches::default(), &weak_ctx);
        assert!(score < 30.0);
        assert_eq!(
            quality_multiplier(&s, &StrategySwitches::default(), &weak_ctx),
            0.0
        );
    }

    #[test]
    fn score_is_bounded() {
        let mut s = strong_state();
        s.surge = 1_000.0;
        s.rvol_1m = 1_000.0;
        s.imb = 1.0;
        let score = quality_score(&s, &StrategySwitches::default(), &ctx());
        assert!(score <= 100.0);
    }

    #[test]
    fn binary_components_worth_thirty() {
        let s = strong_state();
        let with = quality_score(&s, &StrategySwitches::default(), &ctx());
        let without = quality_score(
            &s,
            &StrategySwitches::default(),
            &QualityContext {
                now: t(9, 20),
                regime_breadth_ok: false,
                not_chop: false,
            },
        );
        assert!((with - without - 30.0).abs() < 1e-9);
    }

    #[test]
    fn qty_risk_parity_base() {
        // equity 1e8, risk 0.5% = 500k KRW; stop distance 500 → 1000 shares
        // before multipliers; quality 1.5 × time 1.0 × program 1.0 → 1500.
        let qty = compute_qty(
            &strong_state(),
            &StrategySwitches::default(),
            &ctx(),
            1e8,
            10_000.0,
            9_500.0,
            1.0,
            1.0,
        );
        assert_eq!(qty, 1_500);
    }

    #[test]
    fn qty_zero_on_degenerate_stop() {
        let qty = compute_qty(
            &strong_state(),
            &StrategySwitches::default(),
            &ctx(),
            1e8,
            10_000.0,
            10_000.0,
            1.0,
            1.0,
        );
        assert_eq!(qty, 0);

        let qty = compute_qty(
            &strong_state(),
            &StrategySwitches::default(),
            &ctx(),
            1e8,
            10_000.0,
            10_500.0,
            1.0,
            1.0,
        );
        assert_eq!(qty, 0);
    }

    #[test]
    fn qty_scales_with_multipliers() {
        let full = compute_qty(
            &strong_state(),
            &StrategySwitches::default(),
            &ctx(),
            1e8,
            10_000.0,
            9_500.0,
            1.0,
            1.0,
        );
        let reduced = compute_qty(
            &strong_state(),
            &StrategySwitches::default(),
            &ctx(),
            1e8,
            10_000.0,
            9_500.0,
            0.85,
            0.5,
        );
        assert!(reduced < full);
        assert_eq!(reduced, (full as f64 * 0.85 * 0.5) as i64);
    }

    #[test]
    fn liquidity_cap_limits_notional() {
        // 5% of 10M KRW = 500k KRW → 50 shares at 10 000.
        assert_eq!(apply_liquidity_cap(1_000, 10_000.0, 10_000_000.0), 50);
        // No data → no cap.
        assert_eq!(apply_liquidity_cap(1_000, 10_000.0, 0.0), 1_000);
        // Under the cap → unchanged.
        assert_eq!(apply_liquidity_cap(10, 10_000.0, 1e9), 10);
    }

    #[test]
    fn nav_cap_limits_notional() {
        // 20% of 1e8 = 2e7 KRW → 2000 shares at 10 000.
        assert_eq!(apply_nav_cap(5_000, 10_000.0, 1e8), 2_000);
        assert_eq!(apply_nav_cap(100, 10_000.0, 1e8), 100);
        assert_eq!(apply_nav_cap(5_000, 10_000.0, 0.0), 5_000);
    }
}

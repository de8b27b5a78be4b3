// =============================================================================
// Entry Gates — OR lock, surge decay, VI wall, spread/RVol, session windows
// =============================================================================

use chrono::{NaiveTime, Timelike};
use tracing::info;

use crate::config::StrategySwitches;

use super::params::{
    ENTRY_CUTOFF, FLATTEN_TIME, MIN_SURGE_BASE, MIN_SURGE_SLOPE_STRICT, OR_RANGE_MAX_STRICT,
    OR_RANGE_MIN, RVOL_MIN, SIZE_DECAY_FLOOR, SIZE_DECAY_SLOPE, SPREAD_MAX_PCT,
    TIME_DECAY_CAP_MIN, VI_COOLDOWN_MIN, VI_WALL_TICKS,
};
use super::state::SymbolState;

/// Minutes elapsed since 09:16 local, floored at zero.
pub fn minutes_since_0916(now: NaiveTime) -> f64 {
    let anchor = super::params::decay_anchor_time();
    let delta = now.signed_duration_since(anchor).num_seconds() as f64 / 60.0;
    delta.max(0.0)
}

/// Surge threshold with linear time decay: `3.0 + slope · min(minutes, 44)`.
pub fn min_surge_threshold(minutes: f64, slope: f64) -> f64 {
    MIN_SURGE_BASE + slope * minutes.clamp(0.0, TIME_DECAY_CAP_MIN)
}

/// Strict-slope variant used for would-block comparisons.
pub fn min_surge_threshold_strict(minutes: f64) -> f64 {
    min_surge_threshold(minutes, MIN_SURGE_SLOPE_STRICT)
}

/// Position-size decay over the entry window: 1.0 → 0.45 floor.
pub fn size_time_multiplier(minutes: f64) -> f64 {
    let m = minutes.clamp(0.0, TIME_DECAY_CAP_MIN);
    (1.0 - SIZE_DECAY_SLOPE * m).max(SIZE_DECAY_FLOOR)
}

/// Record a case where the permissive profile admitted what the strict one
/// would have blocked.
pub fn log_would_block(symbol: &str, reason: &str, actual: f64, strict_threshold: f64) {
    info!(
        symbol,
        reason, actual, strict_threshold, "permissive profile admitted a strict-blocked setup"
    );
}

/// Lock the opening range and validate its width:
/// `OR_RANGE_MIN ≤ (high − low) / mid ≤ or_range_max`.
pub fn lock_or_and_filter(s: &mut SymbolState, switches: &StrategySwitches) -> bool {
    s.or_locked = true;
    s.or_mid = (s.or_high + s.or_low) / 2.0;

    if !s.or_mid.is_finite() || s.or_mid <= 0.0 {
        return false;
    }

    let or_pct = (s.or_high - s.or_low) / s.or_mid;
    let passed = (OR_RANGE_MIN..=switches.or_range_max).contains(&or_pct);

    if passed && or_pct > OR_RANGE_MAX_STRICT {
        log_would_block(&s.code, "OR_RANGE_MAX", or_pct, OR_RANGE_MAX_STRICT);
    }
    passed
}

/// Top-of-book spread within tolerance.
pub fn spread_ok(s: &SymbolState) -> bool {
    s.spread_pct <= SPREAD_MAX_PCT
}

/// Relative 1-minute volume sufficient.
pub fn rvol_ok(s: &SymbolState) -> bool {
    s.rvol_1m >= RVOL_MIN
}

/// Whether an entry at `entry_px` is blocked by volatility-interruption
/// proximity. No reference price means no active interruption; a recent VI
/// event blocks through the cooldown; otherwise the entry is blocked when
/// it sits within the wall below the static +2% trigger band.
pub fn vi_blocked(s: &SymbolState, entry_px: f64, tick: f64, now_epoch: f64) -> bool {
    if s.vi_ref <= 0.0 {
        return false;
    }
    if now_epoch - s.last_vi_ts < VI_COOLDOWN_MIN * 60.0 {
        return true;
    }
    let static_up = s.vi_ref * 1.02;
    let wall = static_up - VI_WALL_TICKS * tick;
    entry_px >= wall
}

/// Inside the opening-range build window (09:00–09:15)?
pub fn is_in_or_window(t: NaiveTime) -> bool {
    t.hour() == 9 && t.minute() < 15
}

/// At or past the entry cutoff (10:00)?
pub fn is_past_entry_cutoff(t: NaiveTime) -> bool {
    (t.hour(), t.minute()) >= ENTRY_CUTOFF
}

/// At or past the flatten time (14:30)?
pub fn is_past_flatten_time(t: NaiveTime) -> bool {
    (t.hour(), t.minute()) >= FLATTEN_TIME
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

    fn state() -> SymbolState {
        SymbolState::new("005930", "IT")
    }

    #[test]
    fn minutes_since_anchor() {
        assert_eq!(minutes_since_0916(t(9, 16)), 0.0);
        assert_eq!(minutes_since_0916(t(9, 30)), 14.0);
        assert_eq!(minutes_since_0916(t(10, 0)), 44.0);
        assert_eq!(minutes_since_0916(t(9, 0)), 0.0);
    }

    #[test]
    fn surge_threshold_decay() {
        assert_eq!(min_surge_threshold(0.0, 0.03), 3.0);
        assert!((min_surge_threshold(10.0, 0.03) - 3.3).abs() < 1e-9);
        assert!((min_surge_threshold(44.0, 0.03) - 4.32).abs() < 1e-9);
        // Capped past 44 minutes.
        assert_eq!(min_surge_threshold(60.0, 0.03), min_surge_threshold(44.0, 0.03));
    }

    #[test]
    fn strict_slope_is_steeper() {
        for minutes in [10.0, 20.0, 30.0] {
            assert!(min_surge_threshold_strict(minutes) > min_surge_threshold(minutes, 0.03));
        }
    }

    #[test]
    fn size_multiplier_decay() {
        assert_eq!(size_time_multiplier(0.0), 1.0);
        assert!((size_time_multiplier(20.0) - 0.76).abs() < 1e-9);
        // 1.0 − 0.012·44 = 0.472, still above the 0.45 floor.
        assert!((size_time_multiplier(45.0) - 0.472).abs() < 1e-9);
        assert!((size_time_multiplier(100.0) - 0.472).abs() < 1e-9);
    }

    #[test]
    fn or_lock_accepts_valid_range() {
        let mut s = state();
        s.or_high = 10_300.0;
        s.or_low = 10_000.0; // ~2.96% of mid
        assert!(lock_or_and_filter(&mut s, &StrategySwitches::default()));
        assert!(s.or_locked);
        assert_eq!(s.or_mid, 10_150.0);
    }

    #[test]
    fn or_lock_rejects_too_narrow_and_too_wide() {
        let switches = StrategySwitches::default();

        let mut narrow = state();
        narrow.or_high = 10_050.0;
        narrow.or_low = 10_000.0; // ~0.5%
        assert!(!lock_or_and_filter(&mut narrow, &switches));

        let mut wide = state();
        wide.or_high = 11_000.0;
        wide.or_low = 10_000.0; // ~9.5%
        assert!(!lock_or_and_filter(&mut wide, &switches));
    }

    #[test]
    fn or_lock_strict_profile_is_tighter() {
        // ~6% range passes permissive (7%) but not conservative (5.5%).
        let mut s = state();
        s.or_high = 10_600.0;
        s.or_low = 10_000.0;
        assert!(lock_or_and_filter(&mut s, &StrategySwitches::default()));

        let mut s = state();
        s.or_high = 10_600.0;
        s.or_low = 10_000.0;
        assert!(!lock_or_and_filter(&mut s, &StrategySwitches::conservative()));
    }

    #[test]
    fn or_lock_rejects_unseeded_range() {
        let mut s = state();
        assert!(!lock_or_and_filter(&mut s, &StrategySwitches::default()));
    }

    #[test]
    fn spread_and_rvol_gates() {
        let mut s = state();
        s.spread_pct = 0.003;
        s.rvol_1m = 2.5;
        assert!(spread_ok(&s));
        assert!(rvol_ok(&s));

        s.spread_pct = 0.005;
        s.rvol_1m = 1.9;
        assert!(!spread_ok(&s));
        assert!(!rvol_ok(&s));
    }

    #[test]
    fn vi_missing_reference_does_not_block() {
        let s = state();
        assert!(!vi_blocked(&s, 10_000.0, 10.0, 1_000_000.0));
    }

    #[test]
    fn vi_cooldown_blocks() {
        let mut s = state();
        s.vi_ref = 10_000.0;
        s.last_vi_ts = 1_000_000.0;
        // 5 minutes later: still inside the 10-minute cooldown.
        assert!(vi_blocked(&s, 9_000.0, 10.0, 1_000_300.0));
        // 11 minutes later, entry far below the wall: clear.
        assert!(!vi_blocked(&s, 9_000.0, 10.0, 1_000_660.0));
    }

    #[test]
    fn vi_wall_blocks_near_trigger() {
        let mut s = state();
        s.vi_ref = 10_000.0;
        s.last_vi_ts = 0.0;
        // Wall = 10200 − 10·10 = 10100.
        assert!(vi_blocked(&s, 10_150.0, 10.0, 1_000_000.0));
        assert!(vi_blocked(&s, 10_100.0, 10.0, 1_000_000.0));
        assert!(!vi_blocked(&s, 10_050.0, 10.0, 1_000_000.0));
    }

    #[test]
    fn session_windows() {
        assert!(is_in_or_window(t(9, 0)));
        assert!(is_in_or_window(t(9, 14)));
        assert!(!is_in_or_window(t(9, 15)));
        assert!(!is_in_or_window(t(10, 0)));

        assert!(!is_past_entry_cutoff(t(9, 59)));
        assert!(is_past_entry_cutoff(t(10, 0)));

        assert!(!is_past_flatten_time(t(14, 29)));
        assert!(is_past_flatten_time(t(14, 30)));
    }
}

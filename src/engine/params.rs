// =============================================================================
// Pinned Strategy Parameters
// =============================================================================
//
// Calibrated against backtests; the tunable subset lives in
// `config::StrategySwitches`. Values here are the strict baselines.
// =============================================================================

use chrono::NaiveTime;

/// No new entries at or past this local time.
pub const ENTRY_CUTOFF: (u32, u32) = (10, 0);
/// Flatten everything at or past this local time.
pub const FLATTEN_TIME: (u32, u32) = (14, 30);
/// Opening range locks at this local time.
pub const OR_LOCK_TIME: (u32, u32) = (9, 15);

/// Minimum opening-range width as a fraction of OR mid.
pub const OR_RANGE_MIN: f64 = 0.012;
/// Strict maximum opening-range width (permissive value is a switch).
pub const OR_RANGE_MAX_STRICT: f64 = 0.055;

/// Minimum relative 1-minute volume at the break.
pub const RVOL_MIN: f64 = 2.0;
/// Maximum top-of-book spread as a fraction of mid.
pub const SPREAD_MAX_PCT: f64 = 0.004;
/// Skip symbols gapping this much from previous close at the open.
pub const GAP_SKIP: f64 = 0.05;

/// Ticks below the static VI trigger treated as a wall.
pub const VI_WALL_TICKS: f64 = 10.0;
/// Minutes of post-VI churn during which entries stay blocked.
pub const VI_COOLDOWN_MIN: f64 = 10.0;

/// Minutes allowed between break and acceptance.
pub const ACCEPT_TIMEOUT_MIN: f64 = 5.0;

/// Fraction of equity risked per trade.
pub const BASE_RISK_PCT: f64 = 0.005;
/// Entry notional capped at this fraction of the last 5-minute traded value.
pub const LIQ_CAP_PCT_5M_VALUE: f64 = 0.05;
/// Entry notional capped at this fraction of equity.
pub const NAV_CAP_PCT: f64 = 0.20;

/// Surge threshold base at 09:16.
pub const MIN_SURGE_BASE: f64 = 3.0;
/// Strict surge decay slope (permissive value is a switch).
pub const MIN_SURGE_SLOPE_STRICT: f64 = 0.04;
/// Size decays by this per minute after 09:16.
pub const SIZE_DECAY_SLOPE: f64 = 0.012;
/// Size multiplier floor.
pub const SIZE_DECAY_FLOOR: f64 = 0.45;
/// Minutes past 09:16 where time decay saturates.
pub const TIME_DECAY_CAP_MIN: f64 = 44.0;

/// Minutes held before the stall-scratch check applies.
pub const STALL_MIN_MINUTES: f64 = 8.0;
/// Minimum R-multiple to avoid the stall scratch.
pub const STALL_R_MIN: f64 = 0.5;
/// Hard stop distance in ATR multiples.
pub const HARD_STOP_ATR_MULT: f64 = 1.2;

/// Quality score below this → skip (strict; permissive value is a switch).
pub const QUALITY_THRESHOLD_LOW: f64 = 40.0;
/// Quality score below this → half size.
pub const QUALITY_THRESHOLD_MED: f64 = 60.0;
/// Quality score at or above this → 1.5x size.
pub const QUALITY_THRESHOLD_HIGH: f64 = 80.0;

/// Program-flow poll cadence (seconds).
pub const PROGRAM_POLL_SEC: u64 = 60;
/// EWMA smoothing factor for program-flow deltas.
pub const EWMA_ALPHA: f64 = 0.35;

/// Reference point for entry time-decay math.
pub fn decay_anchor_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 16, 0).expect("valid anchor time")
}

// =============================================================================
// Exit Engine — hard stop, acceptance failure, stall scratch, adaptive trail
// =============================================================================
//
// Checks run in strict order on every tick while in position:
//   1. portfolio risk-off            4. stall scratch (R-based)
//   2. hard stop                     5. adaptive trailing stop
//   3. acceptance failure (early)
// The first matching condition wins regardless of trailing state.
// =============================================================================

use super::params::{STALL_MIN_MINUTES, STALL_R_MIN};
use super::state::SymbolState;

/// Why a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    RiskOff,
    HardStop,
    AcceptanceFailure,
    StallScratch,
    TrailingStop,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitReason::RiskOff => "risk_off",
            ExitReason::HardStop => "hard_stop",
            ExitReason::AcceptanceFailure => "acceptance_failure",
            ExitReason::StallScratch => "stall_scratch",
            ExitReason::TrailingStop => "trailing_stop",
        };
        f.write_str(name)
    }
}

/// Current R-multiple: profit measured in units of initial risk.
pub fn current_r(s: &SymbolState, last_px: f64) -> f64 {
    let risk = (s.entry_px - s.structure_stop).max(1e-9);
    (last_px - s.entry_px) / risk
}

/// Retracement factor for the trailing stop. Starts at 0.5, ramps toward
/// 0.75 after 15 minutes, and tightens to at least 0.7 under outflow regime
/// or negative tick imbalance.
pub fn retracement_factor(minutes_held: f64, regime: &str, imb: f64) -> f64 {
    let mut f = if minutes_held <= 15.0 {
        0.5
    } else {
        0.5 + ((minutes_held - 15.0) * 0.0167).min(0.25)
    };
    if regime == "outflow" {
        f = f.max(0.7);
    }
    if imb < 0.0 {
        f = f.max(0.7);
    }
    f
}

/// Ratchet the trailing stop. `trail_px` never decreases and never sits
/// below the structural stop.
pub fn update_trail(s: &mut SymbolState, last_px: f64, regime: &str, now_epoch: f64) {
    s.max_fav = s.max_fav.max(last_px);

    let gain = s.max_fav - s.entry_px;
    if gain <= 0.0 {
        return;
    }

    let minutes_held = (now_epoch - s.entry_ts) / 60.0;
    let f = retracement_factor(minutes_held, regime, s.imb);
    let trail = s.entry_px + gain * f;
    s.trail_px = s.trail_px.max(trail).max(s.structure_stop);
}

/// Evaluate all exit conditions in strict order. Returns the first matching
/// reason, updating the trailing stop as a side effect of check 5.
pub fn check_exit_conditions(
    s: &mut SymbolState,
    last_px: f64,
    regime: &str,
    risk_off: bool,
    now_epoch: f64,
) -> Option<ExitReason> {
    if risk_off {
        return Some(ExitReason::RiskOff);
    }

    if last_px <= s.hard_stop {
        return Some(ExitReason::HardStop);
    }

    let minutes_held = (now_epoch - s.entry_ts) / 60.0;

    // Early acceptance failure: lost both the breakout level and VWAP.
    if minutes_held < 15.0 && last_px < s.or_high && last_px < s.vwap {
        return Some(ExitReason::AcceptanceFailure);
    }

    if minutes_held >= STALL_MIN_MINUTES && current_r(s, last_px) < STALL_R_MIN {
        return Some(ExitReason::StallScratch);
    }

    update_trail(s, last_px, regime, now_epoch);
    if last_px <= s.trail_px && s.max_fav > s.entry_px {
        return Some(ExitReason::TrailingStop);
    }

    None
}

// =============================================================================
// Per-Symbol FSM — candidate → break → acceptance → armed → position → done
// =============================================================================
//
// The driver consumes ticks plus ambient context (regime, equity, risk-off)
// and emits order intents. Sector-exposure slots are reserved BEFORE an
// entry intent leaves, so two symbols racing into the same sector cannot
// both pass the cap; the reservation is balanced by `on_entry_fill` or
// `on_entry_rejected`.
// =============================================================================

use chrono::NaiveDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StrategySwitches;
use crate::market::tick_table::tick_size;
use crate::types::{IntentPurpose, OrderIntent, PriceKind, Side};

use super::exits::{check_exit_conditions, ExitReason};
use super::exposure::SectorExposure;
use super::gates::{
    is_past_entry_cutoff, lock_or_and_filter, min_surge_threshold, minutes_since_0916, rvol_ok,
    size_time_multiplier, spread_ok, vi_blocked,
};
use super::params::{ACCEPT_TIMEOUT_MIN, HARD_STOP_ATR_MULT};
use super::sizing::{apply_liquidity_cap, apply_nav_cap, compute_qty, QualityContext};
use super::state::{FsmState, SymbolState};

/// Ambient inputs for one FSM step.
#[derive(Debug, Clone, Copy)]
pub struct FsmContext<'a> {
    pub switches: &'a StrategySwitches,
    /// Program-flow regime label ("strong_inflow" / "outflow" / "mixed").
    pub regime: &'a str,
    pub program_mult: f64,
    pub equity: f64,
    pub risk_off: bool,
    pub regime_breadth_ok: bool,
    pub not_chop: bool,
    /// Local (KST) wall clock.
    pub now: NaiveDateTime,
    /// Epoch seconds, consistent with `now`.
    pub now_epoch: f64,
}

/// What the step decided.
#[derive(Debug, Clone)]
pub enum FsmAction {
    None,
    SubmitEntry(OrderIntent),
    SubmitExit(OrderIntent, ExitReason),
}

/// OR-lock transition: CANDIDATE → WATCH_BREAK when the locked range is
/// tradeable, otherwise DONE.
pub fn lock_opening_range(s: &mut SymbolState, switches: &StrategySwitches) -> bool {
    if s.fsm != FsmState::Candidate {
        return false;
    }
    if lock_or_and_filter(s, switches) {
        s.fsm = FsmState::WatchBreak;
        debug!(symbol = %s.code, or_high = s.or_high, or_low = s.or_low, "watching for break");
        true
    } else {
        s.fsm = FsmState::Done;
        s.skip_reason = "or_range".into();
        false
    }
}

/// Advance the FSM on one price observation.
pub fn on_price_tick(
    s: &mut SymbolState,
    exposure: &mut SectorExposure,
    price: f64,
    ctx: &FsmContext<'_>,
) -> FsmAction {
    if price <= 0.0 {
        return FsmAction::None;
    }

    // Portfolio kill switch: flatten positions, retire everything else.
    if ctx.risk_off {
        return match s.fsm {
            FsmState::InPosition => {
                s.fsm = FsmState::PendingExit;
                FsmAction::SubmitExit(exit_intent(s), ExitReason::RiskOff)
            }
            FsmState::Candidate | FsmState::WatchBreak | FsmState::WaitAcceptance => {
                s.fsm = FsmState::Done;
                s.skip_reason = "risk_off".into();
                FsmAction::None
            }
            _ => FsmAction::None,
        };
    }

    match s.fsm {
        FsmState::WatchBreak => {
            step_watch_break(s, price, ctx);
            FsmAction::None
        }
        FsmState::WaitAcceptance => step_wait_acceptance(s, exposure, price, ctx),
        FsmState::InPosition => {
            match check_exit_conditions(s, price, ctx.regime, false, ctx.now_epoch) {
                Some(reason) => {
                    info!(symbol = %s.code, %reason, price, "exit triggered");
                    s.fsm = FsmState::PendingExit;
                    FsmAction::SubmitExit(exit_intent(s), reason)
                }
                None => FsmAction::None,
            }
        }
        _ => FsmAction::None,
    }
}

/// Break detection: close above the OR high with VWAP support, acceptable
/// spread, optional RVol hard gate, and no VI wall in the way.
fn step_watch_break(s: &mut SymbolState, price: f64, ctx: &FsmContext<'_>) {
    if !s.or_locked {
        return;
    }
    if price <= s.or_high || price < s.vwap {
        return;
    }
    if ctx.switches.enable_rvol_hard_gate && !rvol_ok(s) {
        return;
    }
    if !spread_ok(s) {
        return;
    }
    if vi_blocked(s, price, tick_size(price), ctx.now_epoch) {
        return;
    }

    s.fsm = FsmState::WaitAcceptance;
    s.break_ts = ctx.now_epoch;
    s.retest_low = f64::INFINITY;
    debug!(symbol = %s.code, price, "break detected — waiting for acceptance");
}

/// Acceptance: a pullback below the OR high that (optionally) held VWAP
/// support, then a reclaim — gated by surge decay and quality-aware sizing.
fn step_wait_acceptance(
    s: &mut SymbolState,
    exposure: &mut SectorExposure,
    price: f64,
    ctx: &FsmContext<'_>,
) -> FsmAction {
    s.retest_low = s.retest_low.min(price);

    if ctx.now_epoch - s.break_ts >= ACCEPT_TIMEOUT_MIN * 60.0 {
        s.fsm = FsmState::Done;
        s.skip_reason = "accept_timeout".into();
        return FsmAction::None;
    }
    if is_past_entry_cutoff(ctx.now.time()) {
        s.fsm = FsmState::Done;
        s.skip_reason = "entry_cutoff".into();
        return FsmAction::None;
    }

    let pullback_occurred = s.retest_low < s.or_high;
    let reclaimed = price > s.or_high;
    let held_support = !ctx.switches.require_held_support
        || s.retest_low >= s.vwap * (1.0 - ctx.switches.held_support_tolerance);
    if !(pullback_occurred && reclaimed && held_support) {
        return FsmAction::None;
    }

    // Time-decay surge gate: later acceptances need a stronger premarket
    // surge. A failing gate leaves the symbol waiting — surge does not decay
    // but the threshold keeps rising until the acceptance timeout.
    let minutes = minutes_since_0916(ctx.now.time());
    if s.surge < min_surge_threshold(minutes, ctx.switches.min_surge_slope) {
        return FsmAction::None;
    }

    let entry_px = price;
    let structure_stop = s.retest_low.min(s.or_high);
    if structure_stop <= 0.0 || structure_stop >= entry_px {
        return FsmAction::None;
    }

    let quality_ctx = QualityContext {
        now: ctx.now.time(),
        regime_breadth_ok: ctx.regime_breadth_ok,
        not_chop: ctx.not_chop,
    };
    let mut qty = compute_qty(
        s,
        ctx.switches,
        &quality_ctx,
        ctx.equity,
        entry_px,
        structure_stop,
        ctx.program_mult,
        size_time_multiplier(minutes),
    );
    qty = apply_liquidity_cap(qty, entry_px, s.last_5m_value);
    qty = apply_nav_cap(qty, entry_px, ctx.equity);
    if qty <= 0 {
        return FsmAction::None;
    }

    if !exposure.can_enter(&s.code, qty, entry_px, ctx.equity) {
        s.fsm = FsmState::Done;
        s.skip_reason = "sector_cap".into();
        debug!(symbol = %s.code, sector = exposure.get_sector(&s.code), "sector cap blocked entry");
        return FsmAction::None;
    }

    // Reserve the slot before the order leaves — the fill/reject handler
    // balances this reservation.
    exposure.reserve(&s.code, qty, entry_px);

    s.fsm = FsmState::Armed;
    s.qty = qty;
    s.structure_stop = structure_stop;
    s.hard_stop = hard_stop_for(s, entry_px, structure_stop);
    s.entry_armed_ts = ctx.now_epoch;
    s.regime_at_entry = ctx.regime.to_string();

    info!(
        symbol = %s.code,
        qty,
        entry_px,
        structure_stop = s.structure_stop,
        hard_stop = s.hard_stop,
        "acceptance confirmed — arming entry"
    );

    FsmAction::SubmitEntry(OrderIntent {
        symbol: s.code.clone(),
        side: Side::Buy,
        qty,
        price_kind: PriceKind::Limit,
        limit_px: entry_px,
        purpose: IntentPurpose::Entry,
        client_tag: Uuid::new_v4().to_string(),
    })
}

/// Hard stop: `entry − 1.2·ATR(1m)`, never above the structural stop. With
/// no warm ATR the structural stop doubles as the hard stop.
fn hard_stop_for(s: &SymbolState, entry_px: f64, structure_stop: f64) -> f64 {
    match s.atr_1m {
        Some(atr) if atr > 0.0 => (entry_px - HARD_STOP_ATR_MULT * atr).min(structure_stop),
        _ => structure_stop,
    }
}

fn exit_intent(s: &SymbolState) -> OrderIntent {
    OrderIntent {
        symbol: s.code.clone(),
        side: Side::Sell,
        qty: s.qty,
        price_kind: PriceKind::Market,
        limit_px: 0.0,
        purpose: IntentPurpose::Exit,
        client_tag: Uuid::new_v4().to_string(),
    }
}

/// Broker confirmed the entry fill: ARMED → IN_POSITION.
pub fn on_entry_fill(
    s: &mut SymbolState,
    exposure: &mut SectorExposure,
    qty: i64,
    fill_px: f64,
    now_epoch: f64,
) {
    s.fsm = FsmState::InPosition;
    s.entry_px = fill_px;
    s.entry_ts = now_epoch;
    s.qty = qty;
    s.max_fav = fill_px;
    s.hard_stop = hard_stop_for(s, fill_px, s.structure_stop);
    s.trail_px = s.structure_stop;
    exposure.on_fill(&s.code, qty, fill_px);
    info!(symbol = %s.code, qty, fill_px, "entry filled");
}

/// Entry order rejected or cancelled: release the reservation, retire the
/// symbol for the day.
pub fn on_entry_rejected(s: &mut SymbolState, exposure: &mut SectorExposure, limit_px: f64) {
    exposure.unreserve(&s.code, s.qty, limit_px);
    s.fsm = FsmState::Done;
    s.skip_reason = "entry_rejected".into();
    s.qty = 0;
    info!(symbol = %s.code, "entry rejected — reservation released");
}

/// Exit fill confirmation: PENDING_EXIT → DONE.
pub fn on_exit_fill(s: &mut SymbolState, exposure: &mut SectorExposure) {
    exposure.on_close(&s.code, s.qty, s.entry_px);
    s.fsm = FsmState::Done;
    info!(symbol = %s.code, "exit filled — position closed");
}

// =============================================================================
// Per-Symbol State — indicators, FSM state, position tracking
// =============================================================================
//
// One `SymbolState` per tracked instrument, created at universe-filter time
// and mutated only on the dispatch loop. `reset_for_new_day` clears the
// session-derived fields while daily anchors survive until the next
// premarket refresh.
// =============================================================================

use crate::market::bars::BarAggregator;
use crate::market::imbalance::TickImbalance;
use crate::market::indicators::RollingAtr;

/// Entry/exit state machine per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Candidate,
    WatchBreak,
    WaitAcceptance,
    Armed,
    InPosition,
    PendingExit,
    Done,
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FsmState::Idle => "IDLE",
            FsmState::Candidate => "CANDIDATE",
            FsmState::WatchBreak => "WATCH_BREAK",
            FsmState::WaitAcceptance => "WAIT_ACCEPTANCE",
            FsmState::Armed => "ARMED",
            FsmState::InPosition => "IN_POSITION",
            FsmState::PendingExit => "PENDING_EXIT",
            FsmState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Full per-symbol engine state.
#[derive(Debug, Clone)]
pub struct SymbolState {
    pub code: String,
    pub fsm: FsmState,

    pub sector: String,
    pub skip_reason: String,

    // Daily trend anchor
    pub sma20: f64,
    pub sma60: f64,
    pub prev_close: f64,
    pub trend_ok: bool,

    // Opening range (09:00–09:15)
    pub or_high: f64,
    pub or_low: f64,
    pub or_mid: f64,
    pub or_locked: bool,

    // Session VWAP (cumulative)
    pub cum_vol: f64,
    pub cum_val: f64,
    pub vwap: f64,

    // Premarket scan features
    pub value15: f64,
    pub surge: f64,

    // 1-minute volume
    pub avg_1m_vol: f64,
    pub curr_1m_vol: f64,
    pub rvol_1m: f64,

    // Top of book
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub spread_pct: f64,

    // Acceptance tracking
    pub break_ts: f64,
    pub retest_low: f64,

    // Volatility interruption
    pub vi_ref: f64,
    pub last_vi_ts: f64,

    // Tick imbalance
    pub imb_calc: TickImbalance,
    pub imb: f64,
    pub prev_cum_vol: f64,

    // Position tracking
    pub entry_px: f64,
    pub entry_ts: f64,
    pub qty: i64,
    pub structure_stop: f64,
    pub hard_stop: f64,
    pub max_fav: f64,
    pub trail_px: f64,
    pub regime_at_entry: String,

    // Bar aggregation
    pub bar_1m: BarAggregator,
    pub bar_5m: BarAggregator,
    pub rolling_atr: RollingAtr,
    pub atr_1m: Option<f64>,
    pub last_5m_value: f64,

    // Order tracking
    pub entry_order_id: Option<String>,
    pub entry_armed_ts: f64,
}

impl SymbolState {
    pub fn new(code: impl Into<String>, sector: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            fsm: FsmState::Idle,
            sector: sector.into(),
            skip_reason: String::new(),
            sma20: 0.0,
            sma60: 0.0,
            prev_close: 0.0,
            trend_ok: false,
            or_high: f64::NEG_INFINITY,
            or_low: f64::INFINITY,
            or_mid: 0.0,
            or_locked: false,
            cum_vol: 0.0,
            cum_val: 0.0,
            vwap: 0.0,
            value15: 0.0,
            surge: 0.0,
            avg_1m_vol: 0.0,
            curr_1m_vol: 0.0,
            rvol_1m: 0.0,
            bid: 0.0,
            ask: 0.0,
            spread: 0.0,
            spread_pct: 0.0,
            break_ts: 0.0,
            retest_low: f64::INFINITY,
            vi_ref: 0.0,
            last_vi_ts: f64::NEG_INFINITY,
            imb_calc: TickImbalance::default(),
            imb: 0.0,
            prev_cum_vol: 0.0,
            entry_px: 0.0,
            entry_ts: 0.0,
            qty: 0,
            structure_stop: 0.0,
            hard_stop: 0.0,
            max_fav: 0.0,
            trail_px: 0.0,
            regime_at_entry: "mixed".into(),
            bar_1m: BarAggregator::new(1),
            bar_5m: BarAggregator::new(5),
            rolling_atr: RollingAtr::new(14),
            atr_1m: None,
            last_5m_value: 0.0,
            entry_order_id: None,
            entry_armed_ts: 0.0,
        }
    }

    /// Incremental VWAP update (used when the stream has no authoritative
    /// cumulative fields).
    pub fn update_vwap(&mut self, price: f64, volume: f64) {
        self.cum_vol += volume;
        self.cum_val += price * volume;
        if self.cum_vol > 0.0 {
            self.vwap = self.cum_val / self.cum_vol;
        }
    }

    /// Recompute spread and spread fraction from the current top of book.
    pub fn update_spread(&mut self) {
        if self.bid > 0.0 && self.ask > 0.0 {
            self.spread = (self.ask - self.bid).max(0.0);
            let mid = (self.ask + self.bid) / 2.0;
            self.spread_pct = self.spread / mid.max(1e-9);
        }
    }

    /// Clear session-derived fields for the next trading day. Daily anchors
    /// (SMA20/60, prev close, trend flag) survive until the premarket
    /// refresh overwrites them.
    pub fn reset_for_new_day(&mut self) {
        self.fsm = FsmState::Idle;
        self.skip_reason.clear();
        self.or_high = f64::NEG_INFINITY;
        self.or_low = f64::INFINITY;
        self.or_mid = 0.0;
        self.or_locked = false;
        self.cum_vol = 0.0;
        self.cum_val = 0.0;
        self.vwap = 0.0;
        self.value15 = 0.0;
        self.surge = 0.0;
        self.curr_1m_vol = 0.0;
        self.rvol_1m = 0.0;
        self.bid = 0.0;
        self.ask = 0.0;
        self.spread = 0.0;
        self.spread_pct = 0.0;
        self.break_ts = 0.0;
        self.retest_low = f64::INFINITY;
        self.vi_ref = 0.0;
        self.last_vi_ts = f64::NEG_INFINITY;
        self.imb_calc.reset();
        self.imb = 0.0;
        self.prev_cum_vol = 0.0;
        self.entry_px = 0.0;
        self.entry_ts = 0.0;
        self.qty = 0;
        self.structure_stop = 0.0;
        self.hard_stop = 0.0;
        self.max_fav = 0.0;
        self.trail_px = 0.0;
        self.regime_at_entry = "mixed".into();
        self.bar_1m.reset();
        self.bar_5m.reset();
        self.rolling_atr = RollingAtr::new(14);
        self.atr_1m = None;
        self.last_5m_value = 0.0;
        self.entry_order_id = None;
        self.entry_armed_ts = 0.0;
    }
}

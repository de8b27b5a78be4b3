// =============================================================================
// Tick Dispatch — stream events → per-symbol state updates
// =============================================================================
//
// Routes parsed tick / orderbook-top events into VWAP, opening range, VI
// tracking, tick imbalance, bar aggregation, and RVol. All updates for one
// symbol happen on the dispatch loop, so ordering per symbol is strict.
// =============================================================================

use crate::kis::ws::{AskBidMessage, TickMessage};

use super::state::SymbolState;

/// Process one tick event.
///
/// `now_epoch` is the wall-clock receipt time (drives the imbalance window
/// and VI cooldowns); `or_locked` is the session-level opening-range lock.
pub fn on_tick(s: &mut SymbolState, msg: &TickMessage, now_epoch: f64, or_locked: bool) {
    if msg.price <= 0.0 {
        return;
    }

    // Cumulative volume/value from the venue are authoritative; replace
    // wholesale. Fall back to incremental accumulation otherwise.
    if msg.cum_vol > 0.0 && msg.cum_val > 0.0 {
        s.cum_vol = msg.cum_vol;
        s.cum_val = msg.cum_val;
        s.vwap = msg.cum_val / msg.cum_vol;
    } else if msg.volume > 0.0 {
        s.update_vwap(msg.price, msg.volume);
    }

    // Opening range extends only before the lock.
    if !or_locked && !s.or_locked {
        s.or_high = s.or_high.max(msg.price);
        s.or_low = s.or_low.min(msg.price);
    }

    // A new VI reference price marks a fresh interruption event.
    if msg.vi_ref > 0.0 && (msg.vi_ref - s.vi_ref).abs() > f64::EPSILON {
        s.vi_ref = msg.vi_ref;
        s.last_vi_ts = now_epoch;
    }

    // Trade volume for imbalance: prefer the cumulative delta; a backwards
    // cumulative means the session reset upstream, fall back to the tick
    // volume for this observation.
    let trade_vol = if msg.cum_vol > 0.0 {
        let delta = if s.prev_cum_vol > 0.0 {
            msg.cum_vol - s.prev_cum_vol
        } else {
            msg.volume
        };
        s.prev_cum_vol = msg.cum_vol;
        if delta >= 0.0 {
            delta
        } else {
            msg.volume
        }
    } else {
        msg.volume
    };

    if trade_vol > 0.0 {
        s.imb_calc.update(now_epoch, msg.price, trade_vol);
    }
    s.imb = s.imb_calc.compute(now_epoch);

    // Bars. A completed 1-minute bar feeds the rolling ATR and RVol.
    let completed_1m = s.bar_1m.update_tick(msg.timestamp, msg.price, msg.volume);
    s.bar_5m.update_tick(msg.timestamp, msg.price, msg.volume);

    if let Some(bar) = completed_1m {
        if let Some(atr) = s.rolling_atr.update_bar(bar.high, bar.low, bar.close) {
            s.atr_1m = Some(atr);
        }
        s.curr_1m_vol = bar.volume;
        if s.avg_1m_vol > 0.0 {
            s.rvol_1m = bar.volume / s.avg_1m_vol;
        }
    }

    // Last completed 5-minute value, approximated as close · volume.
    if let Some(bar) = s.bar_5m.last_completed() {
        s.last_5m_value = bar.close * bar.volume;
    }
}

/// Process one orderbook-top event.
pub fn on_askbid(s: &mut SymbolState, msg: &AskBidMessage) {
    if msg.bid > 0.0 {
        s.bid = msg.bid;
    }
    if msg.ask > 0.0 {
        s.ask = msg.ask;
    }
    s.update_spread();
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(h: u32, m: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, sec)
            .unwrap()
    }

    fn tick(price: f64, volume: f64, cum_vol: f64, cum_val: f64, t: NaiveDateTime) -> TickMessage {
        TickMessage {
            ticker: "005930".into(),
            price,
            volume,
            cum_vol,
            cum_val,
            vi_ref: 0.0,
            timestamp: t,
        }
    }

    fn state() -> SymbolState {
        SymbolState::new("005930", "IT")
    }

    #[test]
    fn cumulative_fields_replace_vwap_wholesale() {
        let mut s = state();
        s.cum_vol = 1.0;
        s.cum_val = 1.0;
        on_tick(
            &mut s,
            &tick(100.0, 10.0, 500.0, 55_000.0, ts(9, 30, 0)),
            1000.0,
            false,
        );
        assert_eq!(s.cum_vol, 500.0);
        assert_eq!(s.cum_val, 55_000.0);
        assert_eq!(s.vwap, 110.0);
    }

    #[test]
    fn missing_cumulative_falls_back_to_incremental() {
        let mut s = state();
        on_tick(&mut s, &tick(100.0, 10.0, 0.0, 0.0, ts(9, 30, 0)), 1000.0, false);
        on_tick(&mut s, &tick(200.0, 10.0, 0.0, 0.0, ts(9, 30, 1)), 1001.0, false);
        assert_eq!(s.vwap, 150.0);
    }

    #[test]
    fn opening_range_extends_only_before_lock() {
        let mut s = state();
        on_tick(&mut s, &tick(100.0, 1.0, 0.0, 0.0, ts(9, 5, 0)), 1000.0, false);
        on_tick(&mut s, &tick(110.0, 1.0, 0.0, 0.0, ts(9, 6, 0)), 1001.0, false);
        on_tick(&mut s, &tick(95.0, 1.0, 0.0, 0.0, ts(9, 7, 0)), 1002.0, false);
        assert_eq!(s.or_high, 110.0);
        assert_eq!(s.or_low, 95.0);

        // After the lock the range is frozen.
        on_tick(&mut s, &tick(150.0, 1.0, 0.0, 0.0, ts(9, 20, 0)), 1003.0, true);
        assert_eq!(s.or_high, 110.0);
    }

    #[test]
    fn vi_reference_changes_stamp_event_time() {
        let mut s = state();
        let mut msg = tick(100.0, 1.0, 0.0, 0.0, ts(9, 30, 0));
        msg.vi_ref = 105.0;
        on_tick(&mut s, &msg, 1000.0, true);
        assert_eq!(s.vi_ref, 105.0);
        assert_eq!(s.last_vi_ts, 1000.0);

        // Same reference again: no new event.
        on_tick(&mut s, &msg, 2000.0, true);
        assert_eq!(s.last_vi_ts, 1000.0);

        // A different reference is a fresh interruption.
        msg.vi_ref = 110.0;
        on_tick(&mut s, &msg, 3000.0, true);
        assert_eq!(s.last_vi_ts, 3000.0);
    }

    #[test]
    fn imbalance_uses_cumulative_delta() {
        let mut s = state();
        on_tick(&mut s, &tick(100.0, 5.0, 100.0, 10_000.0, ts(9, 30, 0)), 1000.0, true);
        // Uptick with cumulative delta of 40.
        on_tick(&mut s, &tick(101.0, 5.0, 140.0, 14_040.0, ts(9, 30, 1)), 1001.0, true);
        assert!(s.imb > 0.0);
    }

    #[test]
    fn backwards_cumulative_does_not_poison_imbalance() {
        let mut s = state();
        on_tick(&mut s, &tick(100.0, 5.0, 1000.0, 100_000.0, ts(9, 30, 0)), 1000.0, true);
        // Session reset: cumulative went backwards; tick volume is used.
        on_tick(&mut s, &tick(101.0, 5.0, 50.0, 5_050.0, ts(9, 30, 1)), 1001.0, true);
        assert!((-1.0..=1.0).contains(&s.imb));
        assert_eq!(s.prev_cum_vol, 50.0);
    }

    #[test]
    fn completed_minute_bar_updates_rvol() {
        let mut s = state();
        s.avg_1m_vol = 100.0;
        on_tick(&mut s, &tick(100.0, 150.0, 0.0, 0.0, ts(9, 30, 10)), 1000.0, true);
        on_tick(&mut s, &tick(101.0, 150.0, 0.0, 0.0, ts(9, 30, 40)), 1030.0, true);
        // Bucket roll completes the 09:30 bar with volume 300.
        on_tick(&mut s, &tick(102.0, 10.0, 0.0, 0.0, ts(9, 31, 5)), 1065.0, true);
        assert_eq!(s.curr_1m_vol, 300.0);
        assert!((s.rvol_1m - 3.0).abs() < 1e-9);
    }

    #[test]
    fn completed_five_minute_bar_sets_last_value() {
        let mut s = state();
        on_tick(&mut s, &tick(100.0, 50.0, 0.0, 0.0, ts(9, 30, 0)), 1000.0, true);
        on_tick(&mut s, &tick(102.0, 30.0, 0.0, 0.0, ts(9, 34, 0)), 1240.0, true);
        // Roll into the next 5-minute bucket.
        on_tick(&mut s, &tick(103.0, 10.0, 0.0, 0.0, ts(9, 35, 0)), 1300.0, true);
        // Completed bar: close=102, volume=80.
        assert!((s.last_5m_value - 102.0 * 80.0).abs() < 1e-9);
    }

    #[test]
    fn askbid_updates_spread() {
        let mut s = state();
        on_askbid(
            &mut s,
            &AskBidMessage {
                ticker: "005930".into(),
                bid: 9_990.0,
                ask: 10_010.0,
            },
        );
        assert_eq!(s.bid, 9_990.0);
        assert_eq!(s.ask, 10_010.0);
        assert!(s.spread_pct > 0.0);
    }

    #[test]
    fn askbid_zero_side_keeps_previous() {
        let mut s = state();
        s.bid = 9_990.0;
        s.ask = 10_010.0;
        on_askbid(
            &mut s,
            &AskBidMessage {
                ticker: "005930".into(),
                bid: 0.0,
                ask: 10_020.0,
            },
        );
        assert_eq!(s.bid, 9_990.0);
        assert_eq!(s.ask, 10_020.0);
    }
}

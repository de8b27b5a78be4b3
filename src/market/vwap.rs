// =============================================================================
// VWAP Ledger — cumulative price·volume accumulator
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::bars::Bar;

/// Cumulative VWAP state. Accumulators are monotonic non-decreasing between
/// `reset` calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VwapLedger {
    pub cum_vol: f64,
    pub cum_pv: f64,
    pub anchor_date: Option<NaiveDate>,
}

impl VwapLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current VWAP, or 0 when no volume has accumulated.
    pub fn vwap(&self) -> f64 {
        if self.cum_vol <= 0.0 {
            0.0
        } else {
            self.cum_pv / self.cum_vol
        }
    }

    /// Accumulate one trade. Non-positive price or volume is ignored.
    pub fn update_from_tick(&mut self, price: f64, volume: f64) {
        if price <= 0.0 || volume <= 0.0 {
            return;
        }
        self.cum_vol += volume;
        self.cum_pv += price * volume;
    }

    /// Accumulate one bar at its typical price `(H + L + C) / 3`.
    pub fn update_from_bar(&mut self, bar: &Bar) {
        if bar.volume <= 0.0 {
            return;
        }
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        self.cum_vol += bar.volume;
        self.cum_pv += typical * bar.volume;
    }

    /// Zero both accumulators and move the anchor.
    pub fn reset(&mut self, anchor: Option<NaiveDate>) {
        self.cum_vol = 0.0;
        self.cum_pv = 0.0;
        self.anchor_date = anchor;
    }
}

/// Typical-price VWAP over daily bars dated on or after `anchor_date`.
pub fn compute_anchored_daily_vwap(bars: &[Bar], anchor_date: NaiveDate) -> f64 {
    let mut cum_vol = 0.0;
    let mut cum_pv = 0.0;

    for bar in bars {
        if bar.ts.date() < anchor_date || bar.volume <= 0.0 {
            continue;
        }
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        cum_vol += bar.volume;
        cum_pv += typical * bar.volume;
    }

    if cum_vol > 0.0 {
        cum_pv / cum_vol
    } else {
        0.0
    }
}

/// Symmetric band around a VWAP value: `(vwap·(1-pct), vwap·(1+pct))`.
pub fn vwap_band(vwap: f64, band_pct: f64) -> (f64, f64) {
    (vwap * (1.0 - band_pct), vwap * (1.0 + band_pct))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn daily_bar(d: u32, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            ts: day(d).and_hms_opt(15, 30, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn two_tick_average() {
        // Equal volumes at 100 and 200 average to 150.
        let mut ledger = VwapLedger::new();
        ledger.update_from_tick(100.0, 10.0);
        ledger.update_from_tick(200.0, 10.0);
        assert_eq!(ledger.vwap(), 150.0);
    }

    #[test]
    fn empty_ledger_is_zero() {
        assert_eq!(VwapLedger::new().vwap(), 0.0);
    }

    #[test]
    fn non_positive_inputs_ignored() {
        let mut ledger = VwapLedger::new();
        ledger.update_from_tick(0.0, 10.0);
        ledger.update_from_tick(100.0, 0.0);
        ledger.update_from_tick(-5.0, 10.0);
        assert_eq!(ledger.cum_vol, 0.0);
        assert_eq!(ledger.cum_pv, 0.0);
    }

    #[test]
    fn accumulators_monotonic() {
        let mut ledger = VwapLedger::new();
        let mut prev_vol = 0.0;
        let mut prev_pv = 0.0;
        for i in 1..20 {
            ledger.update_from_tick(100.0 + i as f64, i as f64);
            assert!(ledger.cum_vol >= prev_vol);
            assert!(ledger.cum_pv >= prev_pv);
            assert!(ledger.vwap() >= 0.0);
            prev_vol = ledger.cum_vol;
            prev_pv = ledger.cum_pv;
        }
    }

    #[test]
    fn bar_update_uses_typical_price() {
        let mut ledger = VwapLedger::new();
        ledger.update_from_bar(&daily_bar(4, 110.0, 90.0, 100.0, 30.0));
        assert_eq!(ledger.cum_vol, 30.0);
        assert_eq!(ledger.vwap(), 100.0);
    }

    #[test]
    fn zero_volume_bar_ignored() {
        let mut ledger = VwapLedger::new();
        ledger.update_from_bar(&daily_bar(4, 110.0, 90.0, 100.0, 0.0));
        assert_eq!(ledger.cum_vol, 0.0);
    }

    #[test]
    fn reset_zeros_and_moves_anchor() {
        let mut ledger = VwapLedger::new();
        ledger.update_from_tick(100.0, 10.0);
        ledger.reset(Some(day(5)));
        assert_eq!(ledger.cum_vol, 0.0);
        assert_eq!(ledger.vwap(), 0.0);
        assert_eq!(ledger.anchor_date, Some(day(5)));
    }

    #[test]
    fn anchored_vwap_filters_by_date() {
        let bars = vec![
            daily_bar(1, 100.0, 100.0, 100.0, 10.0), // before anchor, skipped
            daily_bar(4, 200.0, 200.0, 200.0, 10.0),
            daily_bar(5, 300.0, 300.0, 300.0, 10.0),
        ];
        let v = compute_anchored_daily_vwap(&bars, day(4));
        assert_eq!(v, 250.0);
    }

    #[test]
    fn anchored_vwap_empty_is_zero() {
        assert_eq!(compute_anchored_daily_vwap(&[], day(1)), 0.0);
    }

    #[test]
    fn band_is_symmetric() {
        let (lo, hi) = vwap_band(100.0, 0.005);
        assert_eq!(lo, 99.5);
        assert_eq!(hi, 100.5);
    }
}

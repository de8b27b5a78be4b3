// =============================================================================
// KRX Tick-Size Table — price band → minimum tick increment
// =============================================================================

/// KRX cash-equity price bands as `(upper_exclusive_price, tick)` pairs,
/// effective 2023-01-02.
const BANDS: &[(f64, f64)] = &[
    (2_000.0, 1.0),
    (5_000.0, 5.0),
    (20_000.0, 10.0),
    (50_000.0, 50.0),
    (200_000.0, 100.0),
    (500_000.0, 500.0),
];

/// Tick size above the top band boundary.
const TOP_TICK: f64 = 1_000.0;

/// Return the KRX tick size for `price`.
///
/// The first band whose upper bound is strictly greater than `price` wins;
/// prices at or above the top boundary get the top-tier tick.
pub fn tick_size(price: f64) -> f64 {
    for &(upper, tick) in BANDS {
        if price < upper {
            return tick;
        }
    }
    TOP_TICK
}

/// Round `price` down to the nearest multiple of `tick` (truncated division).
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).trunc() * tick
}

/// Round `price` down using the tick size implied by the price itself.
pub fn round_to_tick_auto(price: f64) -> f64 {
    round_to_tick(price, tick_size(price))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_boundaries() {
        assert_eq!(tick_size(1_999.0), 1.0);
        assert_eq!(tick_size(2_000.0), 5.0);
        assert_eq!(tick_size(4_999.0), 5.0);
        assert_eq!(tick_size(5_000.0), 10.0);
        assert_eq!(tick_size(19_999.0), 10.0);
        assert_eq!(tick_size(20_000.0), 50.0);
        assert_eq!(tick_size(49_999.0), 50.0);
        assert_eq!(tick_size(50_000.0), 100.0);
        assert_eq!(tick_size(199_999.0), 100.0);
        assert_eq!(tick_size(200_000.0), 500.0);
        assert_eq!(tick_size(499_999.0), 500.0);
    }

    #[test]
    fn top_tier() {
        assert_eq!(tick_size(500_000.0), 1_000.0);
        assert_eq!(tick_size(1_200_000.0), 1_000.0);
    }

    #[test]
    fn round_down() {
        assert_eq!(round_to_tick(12_345.0, 10.0), 12_340.0);
        assert_eq!(round_to_tick(73_456.0, 100.0), 73_400.0);
        assert_eq!(round_to_tick(1_999.4, 1.0), 1_999.0);
    }

    #[test]
    fn round_exact_multiple_unchanged() {
        assert_eq!(round_to_tick(50_100.0, 100.0), 50_100.0);
    }

    #[test]
    fn round_auto_uses_price_band() {
        // 73 456 falls in the 50 000–200 000 band (tick 100).
        assert_eq!(round_to_tick_auto(73_456.0), 73_400.0);
    }

    #[test]
    fn round_with_zero_tick_is_identity() {
        assert_eq!(round_to_tick(1234.0, 0.0), 1234.0);
    }
}

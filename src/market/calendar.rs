// =============================================================================
// KRX Trading Calendar — weekend + holiday membership
// =============================================================================
//
// Holidays are injected at construction (the configuration layer owns how
// they are sourced). A date is a trading day iff it is a weekday AND not a
// member of the holiday set.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use thiserror::Error;

/// Errors from trading-day iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalendarError {
    /// No trading day was found within the caller-supplied scan bound.
    #[error("no trading day within {0} calendar days")]
    OutOfRange(u32),
}

/// Korean Exchange trading calendar with holiday support.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    /// Create a calendar from an iterator of non-trading dates.
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Number of configured holidays.
    pub fn holiday_count(&self) -> usize {
        self.holidays.len()
    }

    /// Whether `date` is a trading day (weekday and not a holiday).
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => false,
            _ => !self.holidays.contains(&date),
        }
    }

    /// Previous trading day strictly before `from`, scanning at most
    /// `max_scan_days` calendar days backward.
    pub fn previous_trading_day(
        &self,
        from: NaiveDate,
        max_scan_days: u32,
    ) -> Result<NaiveDate, CalendarError> {
        let mut candidate = from;
        for _ in 0..max_scan_days {
            candidate -= Duration::days(1);
            if self.is_trading_day(candidate) {
                return Ok(candidate);
            }
        }
        Err(CalendarError::OutOfRange(max_scan_days))
    }

    /// Next trading day strictly after `from`, scanning at most
    /// `max_scan_days` calendar days forward.
    pub fn next_trading_day(
        &self,
        from: NaiveDate,
        max_scan_days: u32,
    ) -> Result<NaiveDate, CalendarError> {
        let mut candidate = from;
        for _ in 0..max_scan_days {
            candidate += Duration::days(1);
            if self.is_trading_day(candidate) {
                return Ok(candidate);
            }
        }
        Err(CalendarError::OutOfRange(max_scan_days))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn calendar() -> TradingCalendar {
        // Seollal 2024-02-09 (Fri) + Lunar New Year block.
        TradingCalendar::new([d(2024, 2, 9), d(2024, 2, 12)])
    }

    #[test]
    fn weekday_is_trading_day() {
        assert!(calendar().is_trading_day(d(2024, 2, 7))); // Wednesday
    }

    #[test]
    fn weekend_is_not_trading_day() {
        let cal = calendar();
        assert!(!cal.is_trading_day(d(2024, 2, 10))); // Saturday
        assert!(!cal.is_trading_day(d(2024, 2, 11))); // Sunday
    }

    #[test]
    fn holiday_is_not_trading_day() {
        assert!(!calendar().is_trading_day(d(2024, 2, 9)));
    }

    #[test]
    fn previous_skips_holiday_block() {
        // From Tue 2024-02-13: Mon 12th is holiday, 10/11 weekend,
        // Fri 9th is holiday, so previous trading day is Thu 8th.
        let prev = calendar().previous_trading_day(d(2024, 2, 13), 10).unwrap();
        assert_eq!(prev, d(2024, 2, 8));
    }

    #[test]
    fn next_skips_holiday_block() {
        let next = calendar().next_trading_day(d(2024, 2, 8), 10).unwrap();
        assert_eq!(next, d(2024, 2, 13));
    }

    #[test]
    fn argument_itself_not_considered() {
        // 2024-02-07 is a trading day, but previous/next must move off it.
        let cal = calendar();
        assert_eq!(cal.previous_trading_day(d(2024, 2, 7), 5).unwrap(), d(2024, 2, 6));
        assert_eq!(cal.next_trading_day(d(2024, 2, 7), 5).unwrap(), d(2024, 2, 8));
    }

    #[test]
    fn out_of_range_when_bound_exceeded() {
        // Two-day bound from Tuesday cannot clear the 4-day closure block.
        let err = calendar().previous_trading_day(d(2024, 2, 13), 2).unwrap_err();
        assert_eq!(err, CalendarError::OutOfRange(2));
    }

    #[test]
    fn empty_holiday_set_is_weekday_calendar() {
        let cal = TradingCalendar::default();
        assert!(cal.is_trading_day(d(2024, 2, 9)));
        assert_eq!(cal.next_trading_day(d(2024, 2, 9), 5).unwrap(), d(2024, 2, 12));
    }
}

pub mod bars;
pub mod calendar;
pub mod imbalance;
pub mod indicators;
pub mod tick_table;
pub mod vwap;

pub use bars::{aggregate_bars, Bar, BarAggregator};
pub use calendar::{CalendarError, TradingCalendar};
pub use imbalance::TickImbalance;
pub use indicators::{RollingAtr, RollingSma};
pub use tick_table::{round_to_tick, tick_size};
pub use vwap::VwapLedger;

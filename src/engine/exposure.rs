// =============================================================================
// Sector Exposure — count + notional caps with race-free reservation
// =============================================================================
//
// Entry flow: `can_enter` → `reserve` (BEFORE the order leaves) → on broker
// outcome either `on_fill` (working → open) or `unreserve`. `on_close`
// releases the open slot. Mutators are deltas and saturate at zero;
// `reconcile` is the only atomic rebuild primitive and runs from OMS truth.
// All operations execute on the strategy loop, so no locking is needed.
// =============================================================================

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Enforcement mode for sector caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    Count,
    Pct,
    Both,
}

/// Policy for symbols with no sector mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSectorPolicy {
    Allow,
    Block,
}

/// Sector cap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorExposureConfig {
    pub mode: ExposureMode,
    pub max_positions_per_sector: u32,
    pub max_sector_pct: f64,
    pub unknown_sector_policy: UnknownSectorPolicy,
}

impl Default for SectorExposureConfig {
    fn default() -> Self {
        Self {
            mode: ExposureMode::Both,
            max_positions_per_sector: 2,
            max_sector_pct: 0.30,
            unknown_sector_policy: UnknownSectorPolicy::Allow,
        }
    }
}

const UNKNOWN_SECTOR: &str = "UNKNOWN";

/// Process-wide sector exposure tracker.
#[derive(Debug, Clone)]
pub struct SectorExposure {
    sym_to_sector: HashMap<String, String>,
    config: SectorExposureConfig,
    open_count: HashMap<String, u32>,
    working_count: HashMap<String, u32>,
    open_notional: HashMap<String, f64>,
    working_notional: HashMap<String, f64>,
}

impl SectorExposure {
    pub fn new(sym_to_sector: HashMap<String, String>, config: SectorExposureConfig) -> Self {
        Self {
            sym_to_sector,
            config,
            open_count: HashMap::new(),
            working_count: HashMap::new(),
            open_notional: HashMap::new(),
            working_notional: HashMap::new(),
        }
    }

    /// Sector for a symbol, defaulting to UNKNOWN.
    pub fn get_sector(&self, symbol: &str) -> &str {
        self.sym_to_sector
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_SECTOR)
    }

    /// Whether a new entry of `qty` at `price` fits under the sector cap.
    pub fn can_enter(&self, symbol: &str, qty: i64, price: f64, equity: f64) -> bool {
        let sector = self.get_sector(symbol);
        if sector == UNKNOWN_SECTOR {
            return self.config.unknown_sector_policy == UnknownSectorPolicy::Allow;
        }

        let mode = self.config.mode;

        if matches!(mode, ExposureMode::Count | ExposureMode::Both) {
            let total = self.open_count.get(sector).copied().unwrap_or(0)
                + self.working_count.get(sector).copied().unwrap_or(0);
            if total >= self.config.max_positions_per_sector {
                return false;
            }
        }

        if matches!(mode, ExposureMode::Pct | ExposureMode::Both) && equity > 0.0 {
            let total = self.open_notional.get(sector).copied().unwrap_or(0.0)
                + self.working_notional.get(sector).copied().unwrap_or(0.0)
                + qty as f64 * price;
            if total / equity >= self.config.max_sector_pct {
                return false;
            }
        }

        true
    }

    /// Reserve a working slot BEFORE submitting the order. Must be balanced
    /// by exactly one `unreserve` or `on_fill`; the caller guarantees the
    /// pairing.
    pub fn reserve(&mut self, symbol: &str, qty: i64, price: f64) {
        let sector = self.get_sector(symbol).to_string();
        if sector == UNKNOWN_SECTOR {
            return;
        }
        *self.working_count.entry(sector.clone()).or_insert(0) += 1;
        *self.working_notional.entry(sector).or_insert(0.0) += qty as f64 * price;
    }

    /// Release a reservation after a failed / cancelled / rejected order.
    pub fn unreserve(&mut self, symbol: &str, qty: i64, price: f64) {
        let sector = self.get_sector(symbol).to_string();
        if sector == UNKNOWN_SECTOR {
            return;
        }
        sub_count(&mut self.working_count, &sector, 1);
        sub_notional(&mut self.working_notional, &sector, qty as f64 * price);
    }

    /// Fill confirmation: move the slot from working to open.
    pub fn on_fill(&mut self, symbol: &str, qty: i64, price: f64) {
        let sector = self.get_sector(symbol).to_string();
        if sector == UNKNOWN_SECTOR {
            return;
        }
        let notional = qty as f64 * price;
        sub_count(&mut self.working_count, &sector, 1);
        *self.open_count.entry(sector.clone()).or_insert(0) += 1;
        sub_notional(&mut self.working_notional, &sector, notional);
        *self.open_notional.entry(sector).or_insert(0.0) += notional;
    }

    /// Position close: release the open slot.
    pub fn on_close(&mut self, symbol: &str, qty: i64, price: f64) {
        let sector = self.get_sector(symbol).to_string();
        if sector == UNKNOWN_SECTOR {
            return;
        }
        sub_count(&mut self.open_count, &sector, 1);
        sub_notional(&mut self.open_notional, &sector, qty as f64 * price);
    }

    /// Atomic rebuild from OMS truth: open slots from broker positions,
    /// working counts from symbols with pending entry orders (their notional
    /// is unknown and left at zero).
    pub fn reconcile(
        &mut self,
        positions: &HashMap<String, (i64, f64)>,
        working_symbols: &HashSet<String>,
    ) {
        self.open_count.clear();
        self.working_count.clear();
        self.open_notional.clear();
        self.working_notional.clear();

        for (symbol, &(qty, price)) in positions {
            let sector = self.get_sector(symbol).to_string();
            if sector == UNKNOWN_SECTOR {
                continue;
            }
            *self.open_count.entry(sector.clone()).or_insert(0) += 1;
            *self.open_notional.entry(sector).or_insert(0.0) += qty as f64 * price;
        }

        for symbol in working_symbols {
            let sector = self.get_sector(symbol).to_string();
            if sector == UNKNOWN_SECTOR {
                continue;
            }
            *self.working_count.entry(sector).or_insert(0) += 1;
        }

        debug!(
            open_sectors = self.open_count.len(),
            working_sectors = self.working_count.len(),
            "sector exposure reconciled"
        );
    }

    /// Positions (open + optionally working) currently counted in a sector.
    pub fn count_in_sector(&self, sector: &str, include_working: bool) -> u32 {
        let mut count = self.open_count.get(sector).copied().unwrap_or(0);
        if include_working {
            count += self.working_count.get(sector).copied().unwrap_or(0);
        }
        count
    }

    /// Notional exposure in a sector.
    pub fn notional_in_sector(&self, sector: &str, include_working: bool) -> f64 {
        let mut notional = self.open_notional.get(sector).copied().unwrap_or(0.0);
        if include_working {
            notional += self.working_notional.get(sector).copied().unwrap_or(0.0);
        }
        notional
    }

    /// Sector exposure as a fraction of equity.
    pub fn sector_pct(&self, sector: &str, equity: f64, include_working: bool) -> f64 {
        if equity <= 0.0 {
            return 0.0;
        }
        self.notional_in_sector(sector, include_working) / equity
    }
}

fn sub_count(map: &mut HashMap<String, u32>, sector: &str, amount: u32) {
    let entry = map.entry(sector.to_string()).or_insert(0);
    *entry = entry.saturating_sub(amount);
}

fn sub_notional(map: &mut HashMap<String, f64>, sector: &str, amount: f64) {
    let entry = map.entry(sector.to_string()).or_insert(0.0);
    *entry = (*entry - amount).max(0.0);
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sectors() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("005930".to_string(), "IT".to_string());
        map.insert("000660".to_string(), "IT".to_string());
        map.insert("051910".to_string(), "Chemicals".to_string());
        map
    }

    fn count_config(max: u32) -> SectorExposureConfig {
        SectorExposureConfig {
            mode: ExposureMode::Count,
            max_positions_per_sector: max,
            ..SectorExposureConfig::default()
        }
    }

    #[test]
    fn reservation_blocks_same_sector() {
        // One slot per sector: a reservation on 005930 blocks 000660,
        // unreserve releases it.
        let mut exp = SectorExposure::new(sectors(), count_config(1));
        exp.reserve("005930", 100, 80_000.0);
        assert!(!exp.can_enter("000660", 100, 80_000.0, 1e8));
        exp.unreserve("005930", 100, 80_000.0);
        assert!(exp.can_enter("000660", 100, 80_000.0, 1e8));
    }

    #[test]
    fn other_sector_unaffected() {
        let mut exp = SectorExposure::new(sectors(), count_config(1));
        exp.reserve("005930", 100, 80_000.0);
        assert!(exp.can_enter("051910", 10, 400_000.0, 1e8));
    }

    #[test]
    fn unknown_sector_policy() {
        let allow = SectorExposure::new(sectors(), SectorExposureConfig::default());
        assert!(allow.can_enter("999999", 1, 1_000.0, 1e8));

        let block = SectorExposure::new(
            sectors(),
            SectorExposureConfig {
                unknown_sector_policy: UnknownSectorPolicy::Block,
                ..SectorExposureConfig::default()
            },
        );
        assert!(!block.can_enter("999999", 1, 1_000.0, 1e8));
    }

    #[test]
    fn pct_mode_caps_notional() {
        let cfg = SectorExposureConfig {
            mode: ExposureMode::Pct,
            max_sector_pct: 0.30,
            ..SectorExposureConfig::default()
        };
        let mut exp = SectorExposure::new(sectors(), cfg);
        // 25% of equity open in IT.
        exp.reserve("005930", 250, 100_000.0);
        exp.on_fill("005930", 250, 100_000.0);
        // Another 10% would push past 30%.
        assert!(!exp.can_enter("000660", 100, 100_000.0, 1e8));
        // 4% is fine.
        assert!(exp.can_enter("000660", 40, 100_000.0, 1e8));
    }

    #[test]
    fn fill_moves_working_to_open() {
        let mut exp = SectorExposure::new(sectors(), count_config(2));
        exp.reserve("005930", 100, 80_000.0);
        assert_eq!(exp.count_in_sector("IT", true), 1);
        exp.on_fill("005930", 100, 80_000.0);
        assert_eq!(exp.count_in_sector("IT", true), 1);
        assert_eq!(exp.count_in_sector("IT", false), 1);
        assert_eq!(exp.notional_in_sector("IT", false), 8_000_000.0);
        assert_eq!(exp.notional_in_sector("IT", true), 8_000_000.0);
    }

    #[test]
    fn close_releases_open_slot() {
        let mut exp = SectorExposure::new(sectors(), count_config(1));
        exp.reserve("005930", 100, 80_000.0);
        exp.on_fill("005930", 100, 80_000.0);
        assert!(!exp.can_enter("000660", 100, 80_000.0, 1e8));
        exp.on_close("005930", 100, 80_000.0);
        assert!(exp.can_enter("000660", 100, 80_000.0, 1e8));
        assert_eq!(exp.notional_in_sector("IT", true), 0.0);
    }

    #[test]
    fn decrements_saturate_at_zero() {
        let mut exp = SectorExposure::new(sectors(), count_config(2));
        for _ in 0..5 {
            exp.unreserve("005930", 100, 80_000.0);
            exp.on_close("005930", 100, 80_000.0);
        }
        assert_eq!(exp.count_in_sector("IT", true), 0);
        assert_eq!(exp.notional_in_sector("IT", true), 0.0);
    }

    #[test]
    fn non_negativity_under_arbitrary_mutations() {
        let mut exp = SectorExposure::new(sectors(), count_config(3));
        let ops: [&dyn Fn(&mut SectorExposure); 5] = [
            &|e| e.reserve("005930", 10, 1_000.0),
            &|e| e.unreserve("005930", 10, 1_000.0),
            &|e| e.on_fill("005930", 10, 1_000.0),
            &|e| e.on_close("005930", 10, 1_000.0),
            &|e| e.unreserve("000660", 99, 9_999.0),
        ];
        for i in 0..200 {
            ops[i % ops.len()](&mut exp);
            assert!(exp.count_in_sector("IT", true) < u32::MAX);
            assert!(exp.notional_in_sector("IT", true) >= 0.0);
            assert!(exp.notional_in_sector("IT", false) >= 0.0);
        }
    }

    #[test]
    fn reconcile_rebuilds_from_truth() {
        let mut exp = SectorExposure::new(sectors(), count_config(2));
        exp.reserve("005930", 1, 1.0);
        exp.reserve("005930", 1, 1.0);
        exp.reserve("051910", 1, 1.0);

        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), (100i64, 80_000.0));
        let mut working = HashSet::new();
        working.insert("000660".to_string());

        exp.reconcile(&positions, &working);

        assert_eq!(exp.count_in_sector("IT", false), 1);
        assert_eq!(exp.count_in_sector("IT", true), 2);
        assert_eq!(exp.count_in_sector("Chemicals", true), 0);
        assert_eq!(exp.notional_in_sector("IT", false), 8_000_000.0);
        // Working notional is unknown and stays zero.
        assert_eq!(exp.notional_in_sector("IT", true), 8_000_000.0);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut exp = SectorExposure::new(sectors(), count_config(2));
        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), (100i64, 80_000.0));
        positions.insert("051910".to_string(), (10i64, 400_000.0));
        let mut working = HashSet::new();
        working.insert("000660".to_string());

        exp.reconcile(&positions, &working);
        let once = exp.clone();
        exp.reconcile(&positions, &working);

        assert_eq!(exp.count_in_sector("IT", true), once.count_in_sector("IT", true));
        assert_eq!(
            exp.notional_in_sector("Chemicals", true),
            once.notional_in_sector("Chemicals", true)
        );
        assert_eq!(
            exp.count_in_sector("Chemicals", false),
            once.count_in_sector("Chemicals", false)
        );
    }
}

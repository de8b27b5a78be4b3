// =============================================================================
// OMS Reconciliation — rebuild exposure and FSM state from broker truth
// =============================================================================
//
// Fills arrive out of band, operators close positions by hand, and sector
// caps drift if the engine only sees its own intents. Every 1–2 seconds the
// reconciler snapshots broker positions, rebuilds the exposure maps
// atomically, forces broker-held symbols into IN_POSITION, and retires
// symbols the broker no longer holds.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::kis::client::KisClient;
use crate::types::{KisError, PositionInfo};

use super::exposure::SectorExposure;
use super::state::{FsmState, SymbolState};

/// Reconcile cadence.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Broker position provider. Seam for tests.
pub trait PositionSource {
    async fn positions(&self) -> Result<HashMap<String, PositionInfo>, KisError>;
}

impl PositionSource for KisClient {
    async fn positions(&self) -> Result<HashMap<String, PositionInfo>, KisError> {
        let (positions, _equity) = self.get_balance_sheet().await?;
        Ok(positions)
    }
}

/// One reconciliation pass over in-memory state. Pure with respect to I/O:
/// the caller supplies the broker snapshot.
pub fn apply_reconciliation(
    states: &mut HashMap<String, SymbolState>,
    exposure: &mut SectorExposure,
    positions: &HashMap<String, PositionInfo>,
) {
    // ARMED symbols have working entry orders.
    let working: HashSet<String> = states
        .values()
        .filter(|s| s.fsm == FsmState::Armed)
        .map(|s| s.code.clone())
        .collect();

    let position_pairs: HashMap<String, (i64, f64)> = positions
        .iter()
        .filter(|(_, p)| p.qty > 0)
        .map(|(sym, p)| (sym.clone(), (p.qty, p.avg_px)))
        .collect();

    exposure.reconcile(&position_pairs, &working);

    // Broker-held symbols the engine does not consider open: a fill was
    // seen out of band.
    for (symbol, &(qty, avg_px)) in &position_pairs {
        let Some(s) = states.get_mut(symbol) else {
            continue;
        };
        if !matches!(s.fsm, FsmState::InPosition | FsmState::Done) {
            s.fsm = FsmState::InPosition;
            s.qty = qty;
            if avg_px > 0.0 {
                s.entry_px = avg_px;
                if s.max_fav < avg_px {
                    s.max_fav = avg_px;
                }
            }
            info!(symbol = %symbol, qty, avg_px, "reconciled to IN_POSITION");
        }
    }

    // Symbols the engine thinks are open but the broker does not hold.
    for s in states.values_mut() {
        if s.fsm == FsmState::InPosition && !position_pairs.contains_key(&s.code) {
            s.fsm = FsmState::Done;
            s.skip_reason = "closed_externally".into();
            info!(symbol = %s.code, "position closed externally");
        }
    }
}

/// Background loop: fetch broker positions and reconcile. Transport errors
/// are logged and the pass is skipped.
pub async fn run_reconcile_loop<P: PositionSource>(
    api: &P,
    states: Arc<RwLock<HashMap<String, SymbolState>>>,
    exposure: Arc<RwLock<SectorExposure>>,
) {
    let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        interval.tick().await;
        match api.positions().await {
            Ok(positions) => {
                let mut states = states.write();
                let mut exposure = exposure.write();
                apply_reconciliation(&mut states, &mut exposure, &positions);
            }
            Err(e) => {
                debug!(error = %e, "reconciliation snapshot failed");
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::exposure::SectorExposureConfig;

    fn setup() -> (HashMap<String, SymbolState>, SectorExposure) {
        let mut sectors = HashMap::new();
        sectors.insert("005930".to_string(), "IT".to_string());
        sectors.insert("000660".to_string(), "IT".to_string());
        let exposure = SectorExposure::new(sectors, SectorExposureConfig::default());

        let mut states = HashMap::new();
        states.insert("005930".to_string(), SymbolState::new("005930", "IT"));
        states.insert("000660".to_string(), SymbolState::new("000660", "IT"));
        (states, exposure)
    }

    fn pos(qty: i64, avg_px: f64) -> PositionInfo {
        PositionInfo { qty, avg_px }
    }

    #[test]
    fn broker_position_forces_in_position() {
        let (mut states, mut exposure) = setup();
        states.get_mut("005930").unwrap().fsm = FsmState::Armed;

        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), pos(100, 71_000.0));
        apply_reconciliation(&mut states, &mut exposure, &positions);

        let s = &states["005930"];
        assert_eq!(s.fsm, FsmState::InPosition);
        assert_eq!(s.qty, 100);
        assert_eq!(s.entry_px, 71_000.0);
        assert_eq!(exposure.count_in_sector("IT", false), 1);
    }

    #[test]
    fn externally_closed_position_retires() {
        let (mut states, mut exposure) = setup();
        {
            let s = states.get_mut("005930").unwrap();
            s.fsm = FsmState::InPosition;
            s.qty = 100;
        }

        apply_reconciliation(&mut states, &mut exposure, &HashMap::new());

        assert_eq!(states["005930"].fsm, FsmState::Done);
        assert_eq!(states["005930"].skip_reason, "closed_externally");
        assert_eq!(exposure.count_in_sector("IT", true), 0);
    }

    #[test]
    fn armed_symbols_counted_as_working() {
        let (mut states, mut exposure) = setup();
        states.get_mut("000660").unwrap().fsm = FsmState::Armed;

        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), pos(50, 70_000.0));
        apply_reconciliation(&mut states, &mut exposure, &positions);

        // 005930 was forced into IN_POSITION; 000660 stays a working order.
        assert_eq!(exposure.count_in_sector("IT", false), 1);
        assert_eq!(exposure.count_in_sector("IT", true), 2);
        assert_eq!(states["000660"].fsm, FsmState::Armed);
    }

    #[test]
    fn done_symbols_stay_done() {
        let (mut states, mut exposure) = setup();
        states.get_mut("005930").unwrap().fsm = FsmState::Done;

        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), pos(100, 71_000.0));
        apply_reconciliation(&mut states, &mut exposure, &positions);

        // DONE is terminal for the session even if the broker still holds.
        assert_eq!(states["005930"].fsm, FsmState::Done);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let (mut states, mut exposure) = setup();
        states.get_mut("005930").unwrap().fsm = FsmState::Armed;
        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), pos(100, 71_000.0));

        apply_reconciliation(&mut states, &mut exposure, &positions);
        let fsm_once = states["005930"].fsm;
        let count_once = exposure.count_in_sector("IT", true);

        apply_reconciliation(&mut states, &mut exposure, &positions);
        assert_eq!(states["005930"].fsm, fsm_once);
        assert_eq!(exposure.count_in_sector("IT", true), count_once);
    }

    #[test]
    fn zero_qty_positions_ignored() {
        let (mut states, mut exposure) = setup();
        {
            let s = states.get_mut("005930").unwrap();
            s.fsm = FsmState::InPosition;
            s.qty = 100;
        }
        let mut positions = HashMap::new();
        positions.insert("005930".to_string(), pos(0, 71_000.0));
        apply_reconciliation(&mut states, &mut exposure, &positions);
        assert_eq!(states["005930"].fsm, FsmState::Done);
    }
}

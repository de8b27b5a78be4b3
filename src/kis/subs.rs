// =============================================================================
// Subscription Budget Manager — combined stream cap + focus-set refresh
// =============================================================================
//
// KIS allows 41 realtime registrations per session across all stream types;
// the usable default is 40 to keep one slot free for execution
// notifications. The manager enforces the combined cap over tick and
// orderbook-top subscriptions, evicting tick-only symbols first when a tick
// slot is needed and any orderbook member when an orderbook slot is needed.
//
// The focus set limits orderbook-top coverage to the symbols closest to
// triggering: ARMED / IN_POSITION always, then WAIT_ACCEPTANCE symbols
// within 5 ticks of the opening-range high, then the rest.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::state::{FsmState, SymbolState};
use crate::market::tick_table::tick_size;

use super::ws::KisWsClient;

/// Usable registration cap (vendor hard limit is 41; one slot reserved for
/// execution notifications).
pub const WS_MAX_REGS_DEFAULT: usize = 40;
/// Maximum symbols carrying an orderbook-top subscription.
pub const FOCUS_MAX_DEFAULT: usize = 10;

/// The slice of the WebSocket client the manager drives. Seam for tests.
pub trait StreamBackend: Send + Sync {
    fn tick_subs(&self) -> HashSet<String>;
    fn asp_subs(&self) -> HashSet<String>;
    async fn subscribe_tick(&self, ticker: &str) -> bool;
    async fn subscribe_askbid(&self, ticker: &str) -> bool;
    async fn unsubscribe_tick(&self, ticker: &str);
    async fn unsubscribe_askbid(&self, ticker: &str);
}

impl StreamBackend for KisWsClient {
    fn tick_subs(&self) -> HashSet<String> {
        KisWsClient::tick_subs(self)
    }
    fn asp_subs(&self) -> HashSet<String> {
        KisWsClient::asp_subs(self)
    }
    async fn subscribe_tick(&self, ticker: &str) -> bool {
        KisWsClient::subscribe_tick(self, ticker).await
    }
    async fn subscribe_askbid(&self, ticker: &str) -> bool {
        KisWsClient::subscribe_askbid(self, ticker).await
    }
    async fn unsubscribe_tick(&self, ticker: &str) {
        KisWsClient::unsubscribe_tick(self, ticker).await
    }
    async fn unsubscribe_askbid(&self, ticker: &str) {
        KisWsClient::unsubscribe_askbid(self, ticker).await
    }
}

/// Tracks tick and orderbook-top registrations against the combined cap.
pub struct SubscriptionManager<B: StreamBackend = KisWsClient> {
    backend: Arc<B>,
    max_regs: usize,
    focus_max: usize,
}

impl<B: StreamBackend> SubscriptionManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_limits(backend, WS_MAX_REGS_DEFAULT, FOCUS_MAX_DEFAULT)
    }

    pub fn with_limits(backend: Arc<B>, max_regs: usize, focus_max: usize) -> Self {
        if max_regs > WS_MAX_REGS_DEFAULT {
            warn!(
                max_regs,
                vendor_cap = WS_MAX_REGS_DEFAULT,
                "max_regs exceeds the usable vendor cap; excess registrations will be rejected upstream"
            );
        }
        Self {
            backend,
            max_regs,
            focus_max,
        }
    }

    pub fn total_regs(&self) -> usize {
        self.backend.tick_subs().len() + self.backend.asp_subs().len()
    }

    pub fn tick_subs(&self) -> HashSet<String> {
        self.backend.tick_subs()
    }

    pub fn asp_subs(&self) -> HashSet<String> {
        self.backend.asp_subs()
    }

    // -------------------------------------------------------------------------
    // Budget-gated ensure
    // -------------------------------------------------------------------------

    /// Ensure `ticker` has a tick subscription. Returns false when the
    /// budget stays saturated after eviction.
    pub async fn ensure_tick(&self, ticker: &str) -> bool {
        if self.backend.tick_subs().contains(ticker) {
            return true;
        }
        if self.total_regs() >= self.max_regs {
            self.evict_for_tick().await;
        }
        if self.total_regs() >= self.max_regs {
            return false;
        }
        self.backend.subscribe_tick(ticker).await
    }

    /// Ensure `ticker` has an orderbook-top subscription.
    pub async fn ensure_askbid(&self, ticker: &str) -> bool {
        if self.backend.asp_subs().contains(ticker) {
            return true;
        }
        if self.total_regs() >= self.max_regs {
            self.evict_for_askbid().await;
        }
        if self.total_regs() >= self.max_regs {
            return false;
        }
        self.backend.subscribe_askbid(ticker).await
    }

    /// Default tick eviction: drop a tick-only symbol (one with no
    /// orderbook-top subscription).
    async fn evict_for_tick(&self) {
        let asp = self.backend.asp_subs();
        if let Some(victim) = self
            .backend
            .tick_subs()
            .into_iter()
            .find(|t| !asp.contains(t))
        {
            self.backend.unsubscribe_tick(&victim).await;
        }
    }

    /// Default orderbook eviction: drop any orderbook member.
    async fn evict_for_askbid(&self) {
        if let Some(victim) = self.backend.asp_subs().into_iter().next() {
            self.backend.unsubscribe_askbid(&victim).await;
        }
    }

    /// Drop both streams for a ticker.
    pub async fn drop_all(&self, ticker: &str) {
        self.backend.unsubscribe_askbid(ticker).await;
        self.backend.unsubscribe_tick(ticker).await;
    }

    // -------------------------------------------------------------------------
    // Focus set
    // -------------------------------------------------------------------------

    /// Re-rank the orderbook-top focus set:
    ///   0. ARMED / IN_POSITION — always covered
    ///   1. WAIT_ACCEPTANCE within 5 ticks of the OR high
    ///   2. other WAIT_ACCEPTANCE
    /// The top `focus_max` get orderbook-top coverage; stale orderbook subs
    /// are dropped, and DONE symbols lose both streams.
    pub async fn refresh_focus_list(
        &self,
        states: &HashMap<String, SymbolState>,
        last_price: &HashMap<String, f64>,
    ) {
        let mut focus: Vec<(u8, String)> = Vec::new();

        for s in states.values() {
            match s.fsm {
                FsmState::Armed | FsmState::InPosition => focus.push((0, s.code.clone())),
                FsmState::WaitAcceptance => {
                    let px = last_price.get(&s.code).copied().unwrap_or(0.0);
                    let prio = if px > 0.0 && s.or_high > 0.0 {
                        let ts = tick_size(px);
                        let distance_ticks = if ts > 0.0 {
                            (s.or_high - px) / ts
                        } else {
                            f64::MAX
                        };
                        if distance_ticks <= 5.0 {
                            1
                        } else {
                            2
                        }
                    } else {
                        2
                    };
                    focus.push((prio, s.code.clone()));
                }
                _ => {}
            }
        }

        focus.sort();
        let selected: HashSet<String> =
            focus.into_iter().take(self.focus_max).map(|(_, t)| t).collect();

        for ticker in &selected {
            self.ensure_askbid(ticker).await;
        }
        for ticker in self.backend.asp_subs() {
            if !selected.contains(&ticker) {
                self.backend.unsubscribe_askbid(&ticker).await;
            }
        }

        // DONE symbols keep no streams at all.
        let ticks = self.backend.tick_subs();
        for s in states.values() {
            if s.fsm == FsmState::Done && ticks.contains(&s.code) {
                self.drop_all(&s.code).await;
            }
        }
    }

    /// Drop every stream for symbols not IN_POSITION. Called at the entry
    /// cutoff so the freed slots can hand off to the next strategy. Returns
    /// the number of symbols released.
    pub async fn release_non_position_slots(
        &self,
        states: &HashMap<String, SymbolState>,
    ) -> usize {
        let ticks = self.backend.tick_subs();
        let mut released = 0;
        for s in states.values() {
            if s.fsm != FsmState::InPosition && ticks.contains(&s.code) {
                self.drop_all(&s.code).await;
                released += 1;
            }
        }
        if released > 0 {
            let keeping = states
                .values()
                .filter(|s| s.fsm == FsmState::InPosition)
                .count();
            info!(released, keeping, "released stream slots after entry cutoff");
        }
        released
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    /// In-memory backend that always accepts subscribes.
    #[derive(Default)]
    struct FakeBackend {
        tick: RwLock<HashSet<String>>,
        asp: RwLock<HashSet<String>>,
    }

    impl StreamBackend for FakeBackend {
        fn tick_subs(&self) -> HashSet<String> {
            self.tick.read().clone()
        }
        fn asp_subs(&self) -> HashSet<String> {
            self.asp.read().clone()
        }
        async fn subscribe_tick(&self, ticker: &str) -> bool {
            self.tick.write().insert(ticker.to_string());
            true
        }
        async fn subscribe_askbid(&self, ticker: &str) -> bool {
            self.asp.write().insert(ticker.to_string());
            true
        }
        async fn unsubscribe_tick(&self, ticker: &str) {
            self.tick.write().remove(ticker);
        }
        async fn unsubscribe_askbid(&self, ticker: &str) {
            self.asp.write().remove(ticker);
        }
    }

    fn manager(max_regs: usize, focus_max: usize) -> SubscriptionManager<FakeBackend> {
        SubscriptionManager::with_limits(Arc::new(FakeBackend::default()), max_regs, focus_max)
    }

    fn sym(code: &str, fsm: FsmState) -> SymbolState {
        let mut s = SymbolState::new(code, "IT");
        s.fsm = fsm;
        s
    }

    #[tokio::test]
    async fn cap_is_never_exceeded() {
        let mgr = manager(4, 2);
        for i in 0..10 {
            mgr.ensure_tick(&format!("{:06}", i)).await;
            assert!(mgr.total_regs() <= 4, "cap violated: {}", mgr.total_regs());
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let mgr = manager(4, 2);
        assert!(mgr.ensure_tick("005930").await);
        assert!(mgr.ensure_tick("005930").await);
        assert_eq!(mgr.total_regs(), 1);
    }

    #[tokio::test]
    async fn tick_eviction_prefers_tick_only() {
        let mgr = manager(3, 2);
        assert!(mgr.ensure_tick("A00001").await);
        assert!(mgr.ensure_tick("A00002").await);
        assert!(mgr.ensure_askbid("A00002").await);
        // Budget full. A00001 is tick-only, so it is the victim.
        assert!(mgr.ensure_tick("A00003").await);
        assert!(!mgr.tick_subs().contains("A00001"));
        assert!(mgr.tick_subs().contains("A00003"));
        assert!(mgr.asp_subs().contains("A00002"));
        assert!(mgr.total_regs() <= 3);
    }

    #[tokio::test]
    async fn askbid_eviction_drops_orderbook_member() {
        let mgr = manager(2, 5);
        assert!(mgr.ensure_askbid("A00001").await);
        assert!(mgr.ensure_askbid("A00002").await);
        assert!(mgr.ensure_askbid("A00003").await);
        assert_eq!(mgr.asp_subs().len(), 2);
        assert!(mgr.asp_subs().contains("A00003"));
    }

    #[tokio::test]
    async fn ensure_fails_when_nothing_evictable() {
        // Every tick sub also has an orderbook sub → no tick-only victim.
        let mgr = manager(2, 5);
        assert!(mgr.ensure_tick("A00001").await);
        assert!(mgr.ensure_askbid("A00001").await);
        assert!(!mgr.ensure_tick("A00002").await);
        assert_eq!(mgr.total_regs(), 2);
    }

    #[tokio::test]
    async fn focus_list_prioritizes_position_states() {
        let mgr = manager(40, 2);
        let mut states = HashMap::new();
        states.insert("POS001".to_string(), sym("POS001", FsmState::InPosition));
        states.insert("ARM001".to_string(), sym("ARM001", FsmState::Armed));
        let mut near = sym("NEAR01", FsmState::WaitAcceptance);
        near.or_high = 10_050.0;
        states.insert("NEAR01".to_string(), near);

        let mut prices = HashMap::new();
        prices.insert("NEAR01".to_string(), 10_040.0); // 1 tick below OR high

        mgr.refresh_focus_list(&states, &prices).await;

        // Only 2 focus slots: both position-class symbols win.
        let asp = mgr.asp_subs();
        assert_eq!(asp.len(), 2);
        assert!(asp.contains("POS001"));
        assert!(asp.contains("ARM001"));
    }

    #[tokio::test]
    async fn focus_list_near_trigger_beats_far() {
        let mgr = manager(40, 1);
        let mut states = HashMap::new();
        let mut near = sym("NEAR01", FsmState::WaitAcceptance);
        near.or_high = 10_050.0;
        states.insert("NEAR01".to_string(), near);
        let mut far = sym("FAR001", FsmState::WaitAcceptance);
        far.or_high = 20_000.0;
        states.insert("FAR001".to_string(), far);

        let mut prices = HashMap::new();
        prices.insert("NEAR01".to_string(), 10_040.0); // 1 tick away
        prices.insert("FAR001".to_string(), 15_000.0); // far away

        mgr.refresh_focus_list(&states, &prices).await;
        let asp = mgr.asp_subs();
        assert_eq!(asp.len(), 1);
        assert!(asp.contains("NEAR01"));
    }

    #[tokio::test]
    async fn focus_refresh_drops_done_symbols() {
        let mgr = manager(40, 5);
        mgr.ensure_tick("DONE01").await;
        mgr.ensure_askbid("DONE01").await;

        let mut states = HashMap::new();
        states.insert("DONE01".to_string(), sym("DONE01", FsmState::Done));
        mgr.refresh_focus_list(&states, &HashMap::new()).await;

        assert_eq!(mgr.total_regs(), 0);
    }

    #[tokio::test]
    async fn release_non_position_slots_keeps_positions() {
        let mgr = manager(40, 5);
        mgr.ensure_tick("POS001").await;
        mgr.ensure_tick("WAT001").await;
        mgr.ensure_askbid("WAT001").await;

        let mut states = HashMap::new();
        states.insert("POS001".to_string(), sym("POS001", FsmState::InPosition));
        states.insert("WAT001".to_string(), sym("WAT001", FsmState::WatchBreak));

        let released = mgr.release_non_position_slots(&states).await;
        assert_eq!(released, 1);
        assert!(mgr.tick_subs().contains("POS001"));
        assert!(!mgr.tick_subs().contains("WAT001"));
        assert!(mgr.asp_subs().is_empty());
    }
}

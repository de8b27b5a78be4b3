// =============================================================================
// Program-Flow Regime — market-wide net flow → EWMA → discrete label
// =============================================================================
//
// Polls the broker's cumulative program net-buy per market, differences it
// into deltas (detecting resets when the cumulative goes backwards), smooths
// with an EWMA, and maps the joint sign across KOSPI/KOSDAQ to a regime
// label with a size multiplier. The raw values are opaque scalars; only
// sign and smoothed deltas matter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::kis::client::KisClient;
use crate::rate::bucket::epoch_now;
use crate::types::KisError;

use super::params::{EWMA_ALPHA, PROGRAM_POLL_SEC};

/// Markets tracked for the joint regime.
pub const REGIME_MARKETS: [&str; 2] = ["KOSPI", "KOSDAQ"];

/// Discrete regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeLabel {
    StrongInflow,
    Outflow,
    Mixed,
}

impl RegimeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::StrongInflow => "strong_inflow",
            RegimeLabel::Outflow => "outflow",
            RegimeLabel::Mixed => "mixed",
        }
    }

    /// Position-size multiplier for this regime.
    pub fn multiplier(&self) -> f64 {
        match self {
            RegimeLabel::StrongInflow => 1.10,
            RegimeLabel::Outflow => 0.85,
            RegimeLabel::Mixed => 1.00,
        }
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks market-wide program flow per market.
#[derive(Debug, Clone)]
pub struct MarketProgramRegime {
    alpha: f64,
    prev_cum: HashMap<String, f64>,
    ewma_delta: HashMap<String, f64>,
    pub last_ok_ts: f64,
}

impl Default for MarketProgramRegime {
    fn default() -> Self {
        Self::new(EWMA_ALPHA)
    }
}

impl MarketProgramRegime {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            prev_cum: HashMap::new(),
            ewma_delta: HashMap::new(),
            last_ok_ts: 0.0,
        }
    }

    /// Feed one cumulative observation for a market. The first observation
    /// (or a backwards cumulative, meaning a venue-side reset) initializes
    /// rather than differencing.
    pub fn update(&mut self, market: &str, cumulative: f64, now_ts: f64) {
        match self.prev_cum.get(market) {
            Some(&prev) if cumulative >= prev => {
                let delta = cumulative - prev;
                self.prev_cum.insert(market.to_string(), cumulative);
                let prev_ewma = self.ewma_delta.get(market).copied().unwrap_or(0.0);
                self.ewma_delta.insert(
                    market.to_string(),
                    self.alpha * delta + (1.0 - self.alpha) * prev_ewma,
                );
                self.last_ok_ts = now_ts;
            }
            _ => {
                self.prev_cum.insert(market.to_string(), cumulative);
                self.ewma_delta.insert(market.to_string(), 0.0);
            }
        }
    }

    /// Smoothed delta for a market (0 when unobserved).
    pub fn ewma_delta(&self, market: &str) -> f64 {
        self.ewma_delta.get(market).copied().unwrap_or(0.0)
    }

    /// Joint regime across the tracked markets.
    pub fn regime(&self) -> RegimeLabel {
        let kospi = self.ewma_delta("KOSPI");
        let kosdaq = self.ewma_delta("KOSDAQ");
        if kospi > 0.0 && kosdaq > 0.0 {
            RegimeLabel::StrongInflow
        } else if kospi < 0.0 && kosdaq < 0.0 {
            RegimeLabel::Outflow
        } else {
            RegimeLabel::Mixed
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.regime().multiplier()
    }
}

/// Program net-buy provider. Seam for tests.
pub trait FlowSource {
    async fn program_net_buy(&self, market: &str) -> Result<f64, KisError>;
}

impl FlowSource for KisClient {
    async fn program_net_buy(&self, market: &str) -> Result<f64, KisError> {
        self.get_program_net_buy(market).await
    }
}

/// Background poller: one sample per market every `PROGRAM_POLL_SEC`.
/// Transport hiccups are logged and skipped — the EWMA just sees a longer
/// gap.
pub async fn run_program_poll<C: FlowSource>(api: &C, regime: Arc<RwLock<MarketProgramRegime>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(PROGRAM_POLL_SEC));
    loop {
        interval.tick().await;
        let now = epoch_now();
        for market in REGIME_MARKETS {
            match api.program_net_buy(market).await {
                Ok(cumulative) => {
                    regime.write().update(market, cumulative, now);
                }
                Err(e) => {
                    debug!(market, error = %e, "program flow poll failed");
                }
            }
        }
    }
}

// =============================================================================
// Shared Types — order intents, positions, error taxonomy
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Price kind for an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceKind {
    Limit,
    Market,
}

/// Why an intent exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentPurpose {
    Entry,
    Exit,
    Modify,
}

/// An order intent emitted by the per-symbol engine toward the OMS wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price_kind: PriceKind,
    pub limit_px: f64,
    pub purpose: IntentPurpose,
    pub client_tag: String,
}

/// Intent lifecycle observed from the OMS wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Submitted,
    Accepted,
    Filled,
    Cancelled,
    Rejected,
}

/// A broker-side position snapshot: quantity plus average price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub qty: i64,
    pub avg_px: f64,
}

/// Error taxonomy of the substrate. Construction problems are fatal;
/// transport problems are retried upstream; rate limits never block.
#[derive(Debug, Error)]
pub enum KisError {
    /// Missing or conflicting configuration. Fatal at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connect/read/timeout failure after retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// Token acquisition failed after retries.
    #[error("auth error: {0}")]
    Auth(String),

    /// Vendor-level failure (`rt_cd` not in the success set). Not retried.
    #[error("vendor error rt_cd={rt_cd}: {msg}")]
    Vendor { rt_cd: String, msg: String },

    /// Token bucket empty. Immediate, never blocks.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Circuit breaker is open; call rejected without hitting the wire.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Subscription budget saturated.
    #[error("subscription budget exhausted")]
    Budget,
}

impl KisError {
    /// Short class tag for logs and failure counters.
    pub fn class(&self) -> &'static str {
        match self {
            KisError::Config(_) => "CONFIG",
            KisError::Transport(_) => "TRANSPORT",
            KisError::Auth(_) => "AUTH",
            KisError::Vendor { .. } => "VENDOR",
            KisError::RateLimited(_) => "RATE_LIMITED",
            KisError::CircuitOpen(_) => "CIRCUIT_OPEN",
            KisError::Budget => "BUDGET",
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_display() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Sell.to_string(), "SELL");
    }

    #[test]
    fn error_classes() {
        assert_eq!(KisError::RateLimited("x".into()).class(), "RATE_LIMITED");
        assert_eq!(
            KisError::Vendor {
                rt_cd: "1".into(),
                msg: "bad".into()
            }
            .class(),
            "VENDOR"
        );
    }

    #[test]
    fn intent_roundtrips_through_json() {
        let intent = OrderIntent {
            symbol: "005930".into(),
            side: Side::Buy,
            qty: 10,
            price_kind: PriceKind::Limit,
            limit_px: 71_000.0,
            purpose: IntentPurpose::Entry,
            client_tag: "kmp-1".into(),
        };
        let json = serde_json::to_string(&intent).unwrap();
        let back: OrderIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbol, "005930");
        assert_eq!(back.side, Side::Buy);
    }
}

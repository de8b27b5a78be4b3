// =============================================================================
// Universe Pre-Filter — per-symbol eligibility safety net
// =============================================================================
//
// Validates tickers (price, market class, market cap, 20-day ADTV) before
// strategies build their state maps, catching suspended, delisted, or
// illiquid names early. Transport errors follow the configured fail-open /
// fail-closed policy; missing vendor fields always fail open. Retained
// tickers preserve input order.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::kis::client::KisClient;
use crate::types::KisError;

/// Preferred-share suffix characters on KRX codes.
const PREF_SUFFIXES: [char; 2] = ['5', 'K'];

/// Market-classification prefixes accepted as common equity.
const EQUITY_MARKET_PREFIXES: [&str; 3] = ["KOSPI", "KOSDAQ", "KSQ"];

/// One hundred million KRW — the unit of the `hts_avls` market-cap field.
const EOK_KRW: f64 = 1e8;

/// Filter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseFilterConfig {
    /// Minimum market cap in KRW.
    pub mcap_min: f64,
    /// Maximum market cap in KRW (0 disables the check).
    pub mcap_max: f64,
    /// Minimum 20-day average daily traded value in KRW (0 disables).
    pub adtv_min: f64,
    /// Reject anything not classified KOSPI / KOSDAQ common stock.
    pub exclude_non_equity: bool,
    /// Keep a ticker when its API lookup fails (fail-open).
    pub skip_api_errors: bool,
}

impl Default for UniverseFilterConfig {
    fn default() -> Self {
        Self {
            mcap_min: 20e9,
            mcap_max: 0.0,
            adtv_min: 3e9,
            exclude_non_equity: true,
            skip_api_errors: true,
        }
    }
}

/// Why a ticker was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PreferredShare,
    ApiError,
    NoPrice,
    NotEquity,
    LowMcap,
    HighMcap,
    LowAdtv,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectReason::PreferredShare => "PREFERRED_SHARE",
            RejectReason::ApiError => "API_ERROR",
            RejectReason::NoPrice => "NO_PRICE",
            RejectReason::NotEquity => "NOT_EQUITY",
            RejectReason::LowMcap => "LOW_MCAP",
            RejectReason::HighMcap => "HIGH_MCAP",
            RejectReason::LowAdtv => "LOW_ADTV",
        };
        f.write_str(name)
    }
}

/// A rejected ticker with the offending value (0 when not applicable).
#[derive(Debug, Clone)]
pub struct Rejection {
    pub ticker: String,
    pub reason: RejectReason,
    pub value: f64,
}

/// Price-record provider the filter runs against.
pub trait PriceSource {
    /// Current-price record for a ticker (vendor `output` object).
    async fn current_price(&self, ticker: &str) -> Result<Value, KisError>;
    /// 20-day average daily traded value in KRW.
    async fn adtv_20d(&self, ticker: &str) -> Result<f64, KisError>;
}

impl PriceSource for KisClient {
    async fn current_price(&self, ticker: &str) -> Result<Value, KisError> {
        self.get_current_price(ticker).await
    }
    async fn adtv_20d(&self, ticker: &str) -> Result<f64, KisError> {
        self.get_adtv_20d(ticker).await
    }
}

/// Filter `tickers` by eligibility. Returns the retained tickers in input
/// order plus the tagged rejections.
pub async fn filter_universe<P: PriceSource>(
    api: &P,
    tickers: &[String],
    config: &UniverseFilterConfig,
) -> (Vec<String>, Vec<Rejection>) {
    let mut valid = Vec::with_capacity(tickers.len());
    let mut rejected = Vec::new();

    for ticker in tickers {
        match check_ticker(api, ticker, config).await {
            None => valid.push(ticker.clone()),
            Some(rejection) => rejected.push(rejection),
        }
    }

    info!(
        passed = valid.len(),
        rejected = rejected.len(),
        total = tickers.len(),
        "universe filter complete"
    );
    (valid, rejected)
}

async fn check_ticker<P: PriceSource>(
    api: &P,
    ticker: &str,
    config: &UniverseFilterConfig,
) -> Option<Rejection> {
    let reject = |reason: RejectReason, value: f64| {
        Some(Rejection {
            ticker: ticker.to_string(),
            reason,
            value,
        })
    };

    // Preferred share: decided locally, no network call.
    if ticker
        .chars()
        .last()
        .map(|c| PREF_SUFFIXES.contains(&c))
        .unwrap_or(false)
    {
        return reject(RejectReason::PreferredShare, 0.0);
    }

    let record = match api.current_price(ticker).await {
        Ok(record) => record,
        Err(e) => {
            debug!(ticker, error = %e, "universe filter price lookup failed");
            if config.skip_api_errors {
                return None; // fail-open
            }
            return reject(RejectReason::ApiError, 0.0);
        }
    };

    if record.is_null() {
        if config.skip_api_errors {
            return None;
        }
        return reject(RejectReason::NoPrice, 0.0);
    }

    // Suspended or delisted names report no usable price.
    let price = field_f64(&record, "stck_prpr").unwrap_or(0.0);
    if price == 0.0 {
        return reject(RejectReason::NoPrice, 0.0);
    }

    // Market classification: a present, non-equity value rejects; a missing
    // field fails open.
    if config.exclude_non_equity {
        if let Some(market) = record.get("rprs_mrkt_kor_name").and_then(Value::as_str) {
            if !market.is_empty()
                && !EQUITY_MARKET_PREFIXES
                    .iter()
                    .any(|p| market.starts_with(p))
            {
                return reject(RejectReason::NotEquity, 0.0);
            }
        }
    }

    // Market cap: `hts_avls` arrives in 1e8-KRW units; the fallbacks are
    // assumed to be raw KRW. Missing cap fails open.
    if let Some(mcap) = extract_mcap(&record) {
        if mcap < config.mcap_min {
            return reject(RejectReason::LowMcap, mcap);
        }
        if config.mcap_max > 0.0 && mcap > config.mcap_max {
            return reject(RejectReason::HighMcap, mcap);
        }
    }

    // 20-day traded value (separate call, same error policy).
    if config.adtv_min > 0.0 {
        match api.adtv_20d(ticker).await {
            Ok(adtv) => {
                if adtv < config.adtv_min {
                    return reject(RejectReason::LowAdtv, adtv);
                }
            }
            Err(e) => {
                debug!(ticker, error = %e, "universe filter ADTV lookup failed");
                if !config.skip_api_errors {
                    return reject(RejectReason::ApiError, 0.0);
                }
            }
        }
    }

    None
}

fn field_f64(record: &Value, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn extract_mcap(record: &Value) -> Option<f64> {
    if let Some(v) = field_f64(record, "hts_avls") {
        if v > 0.0 {
            return Some(v * EOK_KRW);
        }
    }
    for key in ["total_mrkt_val", "mrkt_cap"] {
        if let Some(v) = field_f64(record, key) {
            if v > 0.0 {
                return Some(v);
            }
        }
    }
    None
}

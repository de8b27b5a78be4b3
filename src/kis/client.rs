// =============================================================================
// KIS REST Client — authenticated requests, paper TR-ID mapping, breaker
// =============================================================================
//
// Every broker operation passes three gates in order: the circuit breaker,
// the shared rate budget, then the HTTP attempt loop with jittered backoff
// for transient 5xx / transport failures. Vendor-level errors (rt_cd) are
// surfaced through the response envelope and are never retried here.
//
// Paper trading: live TR-IDs are rewritten through an injected map; ids in
// the injected passthrough set are used unchanged. An id in neither is a
// configuration error. Operations the paper server does not cover execute
// transparently against the real endpoint when the fallback credential set
// is configured.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::KisConfig;
use crate::market::bars::Bar;
use crate::rate::budget::EndpointClass;
use crate::rate::shared::SharedRateBudget;
use crate::types::{KisError, OrderIntent, PositionInfo, PriceKind, Side};

use super::auth::KisEnv;
use super::response::ApiResponse;

// Live TR-IDs (endpoint identities). Their paper-mode rewrites are injected
// configuration, never hardcoded here.
pub const TR_CURRENT_PRICE: &str = "FHKST01010100";
pub const TR_DAILY_CHART: &str = "FHKST03010100";
pub const TR_MINUTE_CHART: &str = "FHKST03010200";
pub const TR_BALANCE: &str = "TTTC8434R";
pub const TR_ORDER_BUY: &str = "TTTC0802U";
pub const TR_ORDER_SELL: &str = "TTTC0801U";
pub const TR_ORDER_MODIFY: &str = "TTTC0803U";
pub const TR_PROGRAM_TREND: &str = "FHPPG04600101";

/// HTTP attempts per operation (first try + retries on 5xx/transport).
const MAX_HTTP_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; doubled each retry plus jitter.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
}

/// Consecutive-failure circuit breaker: CLOSED → OPEN after
/// `failure_threshold` failures, OPEN → HALF_OPEN after `recovery_timeout`
/// with a single probe call, then CLOSED on success or back to OPEN.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
            }),
        }
    }

    /// Whether a call may proceed. An OPEN breaker past its recovery
    /// timeout admits exactly one probe (transitioning to HALF_OPEN).
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false, // probe already in flight
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                warn!(
                    failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated KIS REST client.
pub struct KisClient {
    env: Arc<KisEnv>,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    budget: Arc<SharedRateBudget>,
    strategy_id: String,
    paper_map: HashMap<String, String>,
    passthrough: HashSet<String>,
}

impl KisClient {
    pub fn new(env: Arc<KisEnv>, budget: Arc<SharedRateBudget>, cfg: &KisConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            env,
            http,
            breaker: CircuitBreaker::default(),
            budget,
            strategy_id: cfg.strategy_id.clone(),
            paper_map: cfg.paper_tr_id_map.clone(),
            passthrough: cfg.paper_tr_id_passthrough.clone(),
        }
    }

    /// Breaker handle for status introspection.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    // -------------------------------------------------------------------------
    // TR-ID resolution
    // -------------------------------------------------------------------------

    /// Resolve a live TR-ID for the active mode. In paper mode the injected
    /// map wins, then the passthrough set; anything else is a configuration
    /// error.
    pub fn paper_tr_id(&self, live_id: &str) -> Result<String, KisError> {
        resolve_tr_id(
            self.env.is_paper(),
            &self.paper_map,
            &self.passthrough,
            live_id,
        )
    }

    // -------------------------------------------------------------------------
    // Guarded request core
    // -------------------------------------------------------------------------

    async fn headers_for(&self, use_real: bool, tr_id: &str) -> Result<HeaderMap, KisError> {
        let mut headers = if use_real {
            self.env
                .real_api_headers()
                .await?
                .ok_or_else(|| KisError::Config("real-endpoint fallback not configured".into()))?
        } else {
            self.env.base_headers().await?
        };
        if let Ok(v) = HeaderValue::from_str(tr_id) {
            headers.insert(HeaderName::from_static("tr_id"), v);
        }
        if let Ok(v) = HeaderValue::from_str(self.env.custtype()) {
            headers.insert(HeaderName::from_static("custtype"), v);
        }
        Ok(headers)
    }

    /// Gate (breaker → budget) and execute one GET with jittered retries on
    /// 5xx / transport failures.
    async fn request_get(
        &self,
        class: EndpointClass,
        live_tr_id: &str,
        path: &str,
        query: &[(&str, String)],
        use_real: bool,
    ) -> Result<ApiResponse, KisError> {
        let tr_id = if use_real {
            live_tr_id.to_string()
        } else {
            self.paper_tr_id(live_tr_id)?
        };
        self.execute(class, &tr_id, path, Some(query), None, use_real)
            .await
    }

    /// Same gates for a POST carrying a JSON body.
    async fn request_post(
        &self,
        class: EndpointClass,
        live_tr_id: &str,
        path: &str,
        body: Value,
        use_real: bool,
    ) -> Result<ApiResponse, KisError> {
        let tr_id = if use_real {
            live_tr_id.to_string()
        } else {
            self.paper_tr_id(live_tr_id)?
        };
        self.execute(class, &tr_id, path, None, Some(body), use_real)
            .await
    }

    async fn execute(
        &self,
        class: EndpointClass,
        tr_id: &str,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<Value>,
        use_real: bool,
    ) -> Result<ApiResponse, KisError> {
        if !self.breaker.allow() {
            return Err(KisError::CircuitOpen(format!("{tr_id} rejected")));
        }
        if !self.budget.try_consume(class, &self.strategy_id, 1.0) {
            return Err(KisError::RateLimited(format!(
                "{class} budget exhausted for {}",
                self.strategy_id
            )));
        }

        let base = if use_real {
            self.env
                .real_url()
                .ok_or_else(|| KisError::Config("real-endpoint fallback not configured".into()))?
        } else {
            self.env.base_url()
        };
        let url = format!("{base}{path}");
        let headers = self.headers_for(use_real, tr_id).await?;

        let mut last_error = String::new();
        for attempt in 1..=MAX_HTTP_ATTEMPTS {
            let mut req = match &body {
                Some(json) => self.http.post(&url).json(json),
                None => self.http.get(&url),
            };
            req = req.headers(headers.clone());
            if let Some(q) = query {
                req = req.query(q);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        last_error = format!("HTTP {status}");
                        if attempt < MAX_HTTP_ATTEMPTS {
                            self.backoff(attempt).await;
                            continue;
                        }
                        break;
                    }
                    self.breaker.record_success();
                    let envelope = ApiResponse::from_response(resp).await;
                    debug!(tr_id, status = envelope.status(), rt_cd = envelope.rt_cd(), "REST call completed");
                    return Ok(envelope);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_HTTP_ATTEMPTS {
                        warn!(tr_id, attempt, error = %e, "transport error, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                }
            }
        }

        self.breaker.record_failure();
        Err(KisError::Transport(format!(
            "{tr_id} failed after {MAX_HTTP_ATTEMPTS} attempts: {last_error}"
        )))
    }

    async fn backoff(&self, attempt: u32) {
        let base = RETRY_BACKOFF_BASE.as_secs_f64() * f64::from(1u32 << (attempt - 1));
        let jitter: f64 = rand::rng().random_range(0.0..0.25);
        tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
    }

    /// Map a vendor-level failure to `KisError::Vendor`, otherwise hand back
    /// the envelope.
    fn ok_envelope(resp: ApiResponse) -> Result<ApiResponse, KisError> {
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(KisError::Vendor {
                rt_cd: resp.rt_cd().to_string(),
                msg: resp.msg1().to_string(),
            })
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Current-price record (`output` object) for one ticker.
    pub async fn get_current_price(&self, ticker: &str) -> Result<Value, KisError> {
        let resp = self
            .request_get(
                EndpointClass::Quote,
                TR_CURRENT_PRICE,
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                &[
                    ("fid_cond_mrkt_div_code", "J".to_string()),
                    ("fid_input_iscd", ticker.to_string()),
                ],
                false,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;
        Ok(resp.output().cloned().unwrap_or(Value::Null))
    }

    /// Recent 1-minute bars, oldest first.
    pub async fn get_minute_bars(&self, ticker: &str, minutes: u32) -> Result<Vec<Bar>, KisError> {
        let resp = self
            .request_get(
                EndpointClass::Chart,
                TR_MINUTE_CHART,
                "/uapi/domestic-stock/v1/quotations/inquire-time-itemchartprice",
                &[
                    ("fid_cond_mrkt_div_code", "J".to_string()),
                    ("fid_input_iscd", ticker.to_string()),
                    ("fid_input_hour_1", String::new()),
                    ("fid_pw_data_incu_yn", "N".to_string()),
                ],
                false,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;
        let mut bars = parse_minute_bars(resp.get_output("output2", &Value::Null));
        let keep = bars.len().saturating_sub(minutes as usize);
        Ok(bars.split_off(keep))
    }

    /// Recent daily bars, oldest first.
    pub async fn get_daily_bars(&self, ticker: &str) -> Result<Vec<Bar>, KisError> {
        let resp = self
            .request_get(
                EndpointClass::Chart,
                TR_DAILY_CHART,
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                &[
                    ("fid_cond_mrkt_div_code", "J".to_string()),
                    ("fid_input_iscd", ticker.to_string()),
                    ("fid_period_div_code", "D".to_string()),
                    ("fid_org_adj_prc", "0".to_string()),
                ],
                false,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;
        Ok(parse_daily_bars(resp.get_output("output2", &Value::Null)))
    }

    /// 20-day average daily traded value (KRW).
    pub async fn get_adtv_20d(&self, ticker: &str) -> Result<f64, KisError> {
        let bars = self.get_daily_bars(ticker).await?;
        let tail: Vec<&Bar> = bars.iter().rev().take(20).collect();
        if tail.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = tail.iter().map(|b| b.close * b.volume).sum();
        Ok(total / tail.len() as f64)
    }

    /// Market-wide program-trade cumulative net buy. Paper servers do not
    /// cover this endpoint, so it runs against the real endpoint whenever
    /// the fallback credential set exists. The value is an opaque scalar;
    /// only its sign and deltas are meaningful.
    pub async fn get_program_net_buy(&self, market: &str) -> Result<f64, KisError> {
        let use_real = self.env.is_paper() && self.env.has_real_fallback();
        let market_code = if market.eq_ignore_ascii_case("KOSDAQ") {
            "1001"
        } else {
            "0001"
        };
        let resp = self
            .request_get(
                EndpointClass::Flow,
                TR_PROGRAM_TREND,
                "/uapi/domestic-stock/v1/quotations/program-trade-by-stock",
                &[
                    ("fid_cond_mrkt_div_code", "U".to_string()),
                    ("fid_input_iscd", market_code.to_string()),
                ],
                use_real,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;
        let output = resp.get_output("output", &Value::Null);
        let cum = parse_value_f64(output.get("ntby_amt"))
            .or_else(|| parse_value_f64(output.get("ntby_qty")))
            .unwrap_or(0.0);
        Ok(cum)
    }

    // -------------------------------------------------------------------------
    // Account / orders
    // -------------------------------------------------------------------------

    fn account_parts(&self) -> Result<(String, String), KisError> {
        let account = self
            .env
            .account_number()
            .ok_or_else(|| KisError::Config("account number missing".into()))?;
        match account.split_once('-') {
            Some((cano, prdt)) => Ok((cano.to_string(), prdt.to_string())),
            None if account.len() > 8 => {
                Ok((account[..8].to_string(), account[8..].to_string()))
            }
            _ => Err(KisError::Config(format!("malformed account number {account}"))),
        }
    }

    /// Broker positions keyed by symbol, plus total account equity.
    pub async fn get_balance_sheet(
        &self,
    ) -> Result<(HashMap<String, PositionInfo>, f64), KisError> {
        let (cano, prdt) = self.account_parts()?;
        let resp = self
            .request_get(
                EndpointClass::Balance,
                TR_BALANCE,
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                &[
                    ("CANO", cano),
                    ("ACNT_PRDT_CD", prdt),
                    ("AFHR_FLPR_YN", "N".to_string()),
                    ("INQR_DVSN", "02".to_string()),
                    ("UNPR_DVSN", "01".to_string()),
                    ("FUND_STTL_ICLD_YN", "N".to_string()),
                    ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
                    ("PRCS_DVSN", "00".to_string()),
                    ("OFL_YN", String::new()),
                    ("CTX_AREA_FK100", String::new()),
                    ("CTX_AREA_NK100", String::new()),
                ],
                false,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;

        let mut positions = HashMap::new();
        if let Some(rows) = resp.get_output("output1", &Value::Null).as_array() {
            for row in rows {
                let Some(symbol) = row.get("pdno").and_then(Value::as_str) else {
                    continue;
                };
                let qty = parse_value_f64(row.get("hldg_qty")).unwrap_or(0.0) as i64;
                if qty <= 0 {
                    continue;
                }
                let avg_px = parse_value_f64(row.get("pchs_avg_pric")).unwrap_or(0.0);
                positions.insert(symbol.to_string(), PositionInfo { qty, avg_px });
            }
        }

        let equity = resp
            .get_output("output2", &Value::Null)
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| parse_value_f64(row.get("tot_evlu_amt")))
            .unwrap_or(0.0);

        Ok((positions, equity))
    }

    /// Submit an order intent. Returns the broker order id.
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<String, KisError> {
        let (cano, prdt) = self.account_parts()?;
        let tr = match intent.side {
            Side::Buy => TR_ORDER_BUY,
            Side::Sell => TR_ORDER_SELL,
        };
        let (ord_dvsn, unpr) = match intent.price_kind {
            PriceKind::Limit => ("00", intent.limit_px.max(0.0)),
            PriceKind::Market => ("01", 0.0),
        };
        let body = serde_json::json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "PDNO": intent.symbol,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": intent.qty.to_string(),
            "ORD_UNPR": format!("{:.0}", unpr),
        });

        let resp = self
            .request_post(
                EndpointClass::Order,
                tr,
                "/uapi/domestic-stock/v1/trading/order-cash",
                body,
                false,
            )
            .await?;
        let resp = Self::ok_envelope(resp)?;
        resp.output()
            .and_then(|o| o.get("ODNO"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| KisError::Vendor {
                rt_cd: resp.rt_cd().to_string(),
                msg: "order response missing ODNO".into(),
            })
    }

    /// Cancel (or modify to zero) a working order.
    pub async fn cancel_order(&self, order_id: &str, qty: i64) -> Result<(), KisError> {
        let (cano, prdt) = self.account_parts()?;
        let body = serde_json::json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_id,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });
        let resp = self
            .request_post(
                EndpointClass::Order,
                TR_ORDER_MODIFY,
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                body,
                false,
            )
            .await?;
        Self::ok_envelope(resp).map(|_| ())
    }
}

impl std::fmt::Debug for KisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisClient")
            .field("strategy_id", &self.strategy_id)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// TR-ID resolution: live ids pass through outside paper mode; in paper
/// mode the injected map wins, then the passthrough set.
fn resolve_tr_id(
    is_paper: bool,
    map: &HashMap<String, String>,
    passthrough: &HashSet<String>,
    live_id: &str,
) -> Result<String, KisError> {
    if !is_paper {
        return Ok(live_id.to_string());
    }
    if let Some(mapped) = map.get(live_id) {
        return Ok(mapped.clone());
    }
    if passthrough.contains(live_id) {
        return Ok(live_id.to_string());
    }
    Err(KisError::Config(format!(
        "TR-ID {live_id} has no paper-mode mapping"
    )))
}

// ---------------------------------------------------------------------------
// Body parsing helpers
// ---------------------------------------------------------------------------

/// KIS sends numerics as strings; accept both.
fn parse_value_f64(val: Option<&Value>) -> Option<f64> {
    match val? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_minute_bars(output: &Value) -> Vec<Bar> {
    let Some(rows) = output.as_array() else {
        return Vec::new();
    };
    let mut bars: Vec<Bar> = rows
        .iter()
        .filter_map(|row| {
            let date = row.get("stck_bsop_date").and_then(Value::as_str)?;
            let hour = row.get("stck_cntg_hour").and_then(Value::as_str)?;
            let ts = chrono::NaiveDateTime::parse_from_str(
                &format!("{date}{hour}"),
                "%Y%m%d%H%M%S",
            )
            .ok()?;
            Some(Bar {
                ts,
                open: parse_value_f64(row.get("stck_oprc"))?,
                high: parse_value_f64(row.get("stck_hgpr"))?,
                low: parse_value_f64(row.get("stck_lwpr"))?,
                close: parse_value_f64(row.get("stck_prpr"))?,
                volume: parse_value_f64(row.get("cntg_vol")).unwrap_or(0.0),
            })
        })
        .collect();
    bars.sort_by_key(|b| b.ts);
    bars
}

fn parse_daily_bars(output: &Value) -> Vec<Bar> {
    let Some(rows) = output.as_array() else {
        return Vec::new();
    };
    let mut bars: Vec<Bar> = rows
        .iter()
        .filter_map(|row| {
            let date = row.get("stck_bsop_date").and_then(Value::as_str)?;
            let day = chrono::NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
            Some(Bar {
                ts: day.and_hms_opt(15, 30, 0)?,
                open: parse_value_f64(row.get("stck_oprc"))?,
                high: parse_value_f64(row.get("stck_hgpr"))?,
                low: parse_value_f64(row.get("stck_lwpr"))?,
                close: parse_value_f64(row.get("stck_clpr"))?,
                volume: parse_value_f64(row.get("acml_vol")).unwrap_or(0.0),
            })
        })
        .collect();
    bars.sort_by_key(|b| b.ts);
    bars
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_probes_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(10));
        // One probe admitted; the next is not.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_probe_outcome() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_success_resets_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn parse_minute_bars_sorted_oldest_first() {
        let output = json!([
            {"stck_bsop_date": "20240304", "stck_cntg_hour": "093100",
             "stck_oprc": "101", "stck_hgpr": "102", "stck_lwpr": "100",
             "stck_prpr": "101.5", "cntg_vol": "30"},
            {"stck_bsop_date": "20240304", "stck_cntg_hour": "093000",
             "stck_oprc": "100", "stck_hgpr": "101", "stck_lwpr": "99",
             "stck_prpr": "100.5", "cntg_vol": "20"},
        ]);
        let bars = parse_minute_bars(&output);
        assert_eq!(bars.len(), 2);
        assert!(bars[0].ts < bars[1].ts);
        assert_eq!(bars[0].volume, 20.0);
    }

    #[test]
    fn parse_minute_bars_skips_malformed_rows() {
        let output = json!([
            {"stck_bsop_date": "20240304"},
            {"stck_bsop_date": "20240304", "stck_cntg_hour": "093000",
             "stck_oprc": "100", "stck_hgpr": "101", "stck_lwpr": "99",
             "stck_prpr": "100.5", "cntg_vol": "20"},
        ]);
        assert_eq!(parse_minute_bars(&output).len(), 1);
    }

    #[test]
    fn tr_id_passthrough_outside_paper_mode() {
        let out = resolve_tr_id(false, &HashMap::new(), &HashSet::new(), "TTTC0802U");
        assert_eq!(out.unwrap(), "TTTC0802U");
    }

    #[test]
    fn tr_id_mapped_in_paper_mode() {
        let mut map = HashMap::new();
        map.insert("TTTC0802U".to_string(), "VTTC0802U".to_string());
        let out = resolve_tr_id(true, &map, &HashSet::new(), "TTTC0802U");
        assert_eq!(out.unwrap(), "VTTC0802U");
    }

    #[test]
    fn tr_id_passthrough_set_in_paper_mode() {
        let mut passthrough = HashSet::new();
        passthrough.insert("FHKST01010100".to_string());
        let out = resolve_tr_id(true, &HashMap::new(), &passthrough, "FHKST01010100");
        assert_eq!(out.unwrap(), "FHKST01010100");
    }

    #[test]
    fn tr_id_unknown_in_paper_mode_is_config_error() {
        let out = resolve_tr_id(true, &HashMap::new(), &HashSet::new(), "TTTC0802U");
        assert!(matches!(out, Err(KisError::Config(_))));
    }

    #[test]
    fn parse_value_accepts_string_and_number() {
        assert_eq!(parse_value_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(parse_value_f64(Some(&json!(12.5))), Some(12.5));
        assert_eq!(parse_value_f64(Some(&json!(null))), None);
        assert_eq!(parse_value_f64(None), None);
    }
}

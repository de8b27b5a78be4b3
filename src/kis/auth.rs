// =============================================================================
// KIS Authentication — OAuth2 token lifecycle + dual credentials
// =============================================================================
//
// SECURITY: app keys, secrets, and bearer tokens are never logged or exposed
// through Debug output.
//
// Each credential set (primary, optional real-endpoint fallback for paper
// mode) owns an independent token with a 24 h validity minus a 5 minute
// safety buffer. Refresh uses double-checked locking: a lock-free freshness
// probe, then re-validation under the per-set refresh guard before fetching.
// KIS rate-limits token issuance to roughly one per minute per key, so a
// fetch retries up to 5 times with a 65 s gap, treating HTTP 403 as
// retryable rate limiting.
// =============================================================================

use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::{Credentials, KisConfig};
use crate::rate::bucket::epoch_now;
use crate::types::KisError;

/// Token lifetime granted by the vendor.
const TOKEN_VALIDITY_SECS: f64 = 86_400.0;
/// Refresh this many seconds before nominal expiry.
const TOKEN_REFRESH_BUFFER_SECS: f64 = 300.0;
/// Token fetch attempts before giving up.
const TOKEN_FETCH_MAX_ATTEMPTS: u32 = 5;
/// Gap between token fetch attempts.
const TOKEN_FETCH_RETRY_DELAY: Duration = Duration::from_secs(65);
/// Wall-clock timeout for every auth HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct TokenState {
    bearer: Option<String>,
    expires_at: f64,
}

/// One credential set with its independent token lifecycle.
struct CredentialSet {
    url: String,
    app_key: String,
    app_secret: String,
    account_number: Option<String>,
    token: RwLock<TokenState>,
    refresh_guard: AsyncMutex<()>,
}

impl CredentialSet {
    fn new(creds: &Credentials) -> Self {
        Self {
            url: creds.url.trim_end_matches('/').to_string(),
            app_key: creds.app_key.clone(),
            app_secret: creds.app_secret.clone(),
            account_number: if creds.account_number.is_empty() {
                None
            } else {
                Some(creds.account_number.clone())
            },
            token: RwLock::new(TokenState::default()),
            refresh_guard: AsyncMutex::new(()),
        }
    }

    fn fresh_bearer(&self, now: f64) -> Option<String> {
        let state = self.token.read();
        match &state.bearer {
            Some(bearer) if now < state.expires_at - TOKEN_REFRESH_BUFFER_SECS => {
                Some(bearer.clone())
            }
            _ => None,
        }
    }
}

/// KIS environment: validated configuration, tokens, and the WebSocket
/// approval key.
pub struct KisEnv {
    custtype: String,
    user_agent: String,
    hts_id: String,
    is_paper: bool,
    primary: CredentialSet,
    fallback: Option<CredentialSet>,
    approval_key: String,
    http: reqwest::Client,
}

impl KisEnv {
    /// Validate the configuration and perform the initial token + WebSocket
    /// approval-key fetches. Configuration problems are fatal here.
    pub async fn connect(cfg: &KisConfig) -> Result<Self, KisError> {
        Self::validate(cfg)?;

        let primary_creds = if cfg.is_paper {
            cfg.paper.as_ref().expect("validated above")
        } else {
            cfg.live.as_ref().expect("validated above")
        };

        // In paper mode, live credentials double as the real-endpoint
        // fallback for operations the paper server does not cover.
        let fallback = if cfg.is_paper {
            cfg.live.as_ref().map(CredentialSet::new)
        } else {
            None
        };

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| KisError::Config(format!("http client build failed: {e}")))?;

        let env = Self {
            custtype: cfg.custtype.clone(),
            user_agent: cfg.user_agent.clone(),
            hts_id: cfg.hts_id.clone(),
            is_paper: cfg.is_paper,
            primary: CredentialSet::new(primary_creds),
            fallback,
            approval_key: String::new(),
            http,
        };

        if env.fallback.is_some() {
            info!("real-endpoint fallback enabled for paper-unsupported operations");
        }

        // Prime the primary token, then the WS approval key.
        env.ensure_fresh(&env.primary).await?;
        let approval_key = env.fetch_approval_key().await?;

        info!(paper = env.is_paper, "KIS environment ready");
        Ok(Self {
            approval_key,
            ..env
        })
    }

    /// Required-key and mode-credential validation. Failures are fatal at
    /// construction.
    pub fn validate(cfg: &KisConfig) -> Result<(), KisError> {
        let mut missing: Vec<&str> = Vec::new();
        if cfg.custtype.is_empty() {
            missing.push("custtype");
        }
        if cfg.user_agent.is_empty() {
            missing.push("user_agent");
        }
        if cfg.hts_id.is_empty() {
            missing.push("hts_id");
        }
        if !missing.is_empty() {
            return Err(KisError::Config(format!(
                "missing required config keys: {missing:?}"
            )));
        }

        let group = |creds: &Option<Credentials>, label: &str| -> Result<(), KisError> {
            match creds {
                Some(c)
                    if !c.url.is_empty()
                        && !c.app_key.is_empty()
                        && !c.app_secret.is_empty()
                        && !c.account_number.is_empty() =>
                {
                    Ok(())
                }
                _ => Err(KisError::Config(format!(
                    "{label} trading requires url, app_key, app_secret, account_number"
                ))),
            }
        };

        if cfg.is_paper {
            group(&cfg.paper, "paper")
        } else {
            group(&cfg.live, "live")
        }
    }

    // -------------------------------------------------------------------------
    // Headers
    // -------------------------------------------------------------------------

    /// Base headers with a fresh primary authorization token.
    pub async fn base_headers(&self) -> Result<HeaderMap, KisError> {
        let bearer = self.ensure_fresh(&self.primary).await?;
        self.build_headers(&self.primary, &bearer)
    }

    /// Headers for the real-endpoint fallback, or `None` when it is not
    /// configured.
    pub async fn real_api_headers(&self) -> Result<Option<HeaderMap>, KisError> {
        let Some(fallback) = &self.fallback else {
            return Ok(None);
        };
        let bearer = self.ensure_fresh(fallback).await?;
        Ok(Some(self.build_headers(fallback, &bearer)?))
    }

    fn build_headers(&self, set: &CredentialSet, bearer: &str) -> Result<HeaderMap, KisError> {
        let mut headers = HeaderMap::new();
        let put = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), v);
            }
        };
        put(&mut headers, "content-type", "application/json");
        put(&mut headers, "accept", "text/plain");
        put(&mut headers, "charset", "UTF-8");
        put(&mut headers, "user-agent", &self.user_agent);
        put(&mut headers, "appkey", &set.app_key);
        put(&mut headers, "appsecret", &set.app_secret);
        put(&mut headers, "authorization", bearer);
        Ok(headers)
    }

    // -------------------------------------------------------------------------
    // Token lifecycle
    // -------------------------------------------------------------------------

    /// Double-checked refresh: fast lock-free freshness probe, then
    /// re-validation under the per-set refresh guard.
    async fn ensure_fresh(&self, set: &CredentialSet) -> Result<String, KisError> {
        let now = epoch_now();
        if let Some(bearer) = set.fresh_bearer(now) {
            return Ok(bearer);
        }

        let _guard = set.refresh_guard.lock().await;
        if let Some(bearer) = set.fresh_bearer(epoch_now()) {
            return Ok(bearer);
        }

        info!("refreshing access token");
        let bearer = self.fetch_access_token(set).await?;
        {
            let mut state = set.token.write();
            state.bearer = Some(bearer.clone());
            state.expires_at = epoch_now() + TOKEN_VALIDITY_SECS;
        }
        info!("access token refreshed");
        Ok(bearer)
    }

    /// Fetch an OAuth2 token, retrying through the vendor's once-per-minute
    /// issuance limit.
    async fn fetch_access_token(&self, set: &CredentialSet) -> Result<String, KisError> {
        let url = format!("{}/oauth2/tokenP", set.url);
        let payload = json!({
            "grant_type": "client_credentials",
            "appkey": set.app_key,
            "appsecret": set.app_secret,
        });

        let mut last_error = String::new();
        for attempt in 1..=TOKEN_FETCH_MAX_ATTEMPTS {
            match self.http.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 403 {
                        last_error = "rate-limited by vendor (403)".into();
                        if attempt < TOKEN_FETCH_MAX_ATTEMPTS {
                            warn!(
                                attempt,
                                max = TOKEN_FETCH_MAX_ATTEMPTS,
                                delay_s = TOKEN_FETCH_RETRY_DELAY.as_secs(),
                                "token request rate-limited, retrying"
                            );
                            tokio::time::sleep(TOKEN_FETCH_RETRY_DELAY).await;
                            continue;
                        }
                        break;
                    }
                    if !status.is_success() {
                        last_error = format!("token endpoint returned HTTP {status}");
                        if attempt < TOKEN_FETCH_MAX_ATTEMPTS {
                            warn!(attempt, %status, "token request failed, retrying");
                            tokio::time::sleep(TOKEN_FETCH_RETRY_DELAY).await;
                            continue;
                        }
                        break;
                    }
                    let body: serde_json::Value = resp.json().await.map_err(|e| {
                        KisError::Auth(format!("token response parse failed: {e}"))
                    })?;
                    return match body.get("access_token").and_then(|v| v.as_str()) {
                        Some(token) => Ok(format!("Bearer {token}")),
                        None => Err(KisError::Auth("token response missing access_token".into())),
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < TOKEN_FETCH_MAX_ATTEMPTS {
                        warn!(attempt, error = %e, "token request transport error, retrying");
                        tokio::time::sleep(TOKEN_FETCH_RETRY_DELAY).await;
                        continue;
                    }
                }
            }
        }

        error!("token fetch exhausted retries");
        Err(KisError::Auth(format!(
            "token fetch failed after {TOKEN_FETCH_MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Fetch the WebSocket approval key (once, at construction).
    async fn fetch_approval_key(&self) -> Result<String, KisError> {
        let url = format!("{}/oauth2/Approval", self.primary.url);
        let payload = json!({
            "grant_type": "client_credentials",
            "appkey": self.primary.app_key,
            "secretkey": self.primary.app_secret,
        });

        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| KisError::Auth(format!("approval key request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(KisError::Auth(format!(
                "approval key endpoint returned HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| KisError::Auth(format!("approval response parse failed: {e}")))?;
        body.get("approval_key")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| KisError::Auth("approval response missing approval_key".into()))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn is_paper(&self) -> bool {
        self.is_paper
    }

    pub fn has_real_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Endpoint base URL for the active mode.
    pub fn base_url(&self) -> &str {
        &self.primary.url
    }

    /// Real-endpoint base URL when the fallback is configured.
    pub fn real_url(&self) -> Option<&str> {
        self.fallback.as_ref().map(|f| f.url.as_str())
    }

    pub fn account_number(&self) -> Option<&str> {
        self.primary.account_number.as_deref()
    }

    pub fn custtype(&self) -> &str {
        &self.custtype
    }

    pub fn hts_id(&self) -> &str {
        &self.hts_id
    }

    pub fn approval_key(&self) -> &str {
        &self.approval_key
    }
}

impl std::fmt::Debug for KisEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let masked = self
            .primary
            .account_number
            .as_deref()
            .map(|a| format!("{}****", &a[..a.len().min(4)]))
            .unwrap_or_else(|| "N/A".into());
        f.debug_struct("KisEnv")
            .field("mode", if self.is_paper { &"paper" } else { &"live" })
            .field("account", &masked)
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("has_real_fallback", &self.fallback.is_some())
            .finish()
    }
}

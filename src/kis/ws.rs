// =============================================================================
// KIS WebSocket Client — realtime tick / orderbook-top streams
// =============================================================================
//
// One long-lived connection per session. The read loop is single-threaded;
// subscribe operations serialize their sends through the write-half mutex.
// Reconnects use exponential backoff (1 s base, 30 s cap) and the attempt
// counter only resets after the connection has stayed up for 30 s, which
// prevents rapid cycling when the server accepts then immediately drops
// connections. On reconnect every tracked subscription is replayed; a
// ticker whose replay fails is removed from the set so the subscription
// manager can re-enqueue it later.
//
// Frame format: `header^tr_id|enc|count|payload`, payload caret-delimited.
// =============================================================================

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, NaiveTime};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Tick stream TR-ID.
pub const TR_TICK: &str = "H0STCNT0";
/// Orderbook-top stream TR-ID.
pub const TR_ASKBID: &str = "H0STASP0";

/// Broker subscription command ids.
pub const CMD_SUB_ASKBID: u8 = 1;
pub const CMD_UNSUB_ASKBID: u8 = 2;
pub const CMD_SUB_TICK: u8 = 3;
pub const CMD_UNSUB_TICK: u8 = 4;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY_BASE_SECS: f64 = 1.0;
const RECONNECT_DELAY_MAX_SECS: f64 = 30.0;
/// Connection must stay up this long before the backoff counter resets.
const STABLE_CONNECTION_SECS: u64 = 30;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Parsed tick-stream event.
#[derive(Debug, Clone, PartialEq)]
pub struct TickMessage {
    pub ticker: String,
    pub price: f64,
    pub volume: f64,
    pub cum_vol: f64,
    pub cum_val: f64,
    pub vi_ref: f64,
    pub timestamp: NaiveDateTime,
}

/// Parsed orderbook-top event.
#[derive(Debug, Clone, PartialEq)]
pub struct AskBidMessage {
    pub ticker: String,
    pub bid: f64,
    pub ask: f64,
}

// ---------------------------------------------------------------------------
// Frame parsers
// ---------------------------------------------------------------------------

/// Split a raw frame into `(tr_id, data)`. Frames with fewer than four
/// pipe-separated segments are invalid; the tr_id comes from the second
/// caret field of the header segment.
pub fn parse_ws_frame(raw: &str) -> Option<(String, String)> {
    if !raw.contains('|') {
        return None;
    }
    let parts: Vec<&str> = raw.split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    let tr_id = parts[0].split('^').nth(1).unwrap_or("").to_string();
    Some((tr_id, parts[3].to_string()))
}

/// Empty field → 0.0; a non-empty unparseable field poisons the frame.
fn parse_field(fields: &[&str], idx: usize) -> Option<f64> {
    match fields.get(idx) {
        None => Some(0.0),
        Some(s) if s.is_empty() => Some(0.0),
        Some(s) => s.parse().ok(),
    }
}

/// Parse a tick-stream payload. Fields: ticker@0, HHMMSS@1, price@2,
/// tick volume@12, cumulative volume@13, cumulative value@14, VI ref@45.
/// Requires at least 15 fields and a positive price.
pub fn parse_tick_message(data: &str, now: NaiveDateTime) -> Option<TickMessage> {
    let fields: Vec<&str> = data.split('^').collect();
    if fields.len() < 15 {
        return None;
    }
    let ticker = fields[0];
    if ticker.is_empty() {
        return None;
    }

    let price = parse_field(&fields, 2)?;
    let volume = parse_field(&fields, 12)?;
    let cum_vol = parse_field(&fields, 13)?;
    let cum_val = parse_field(&fields, 14)?;
    let vi_ref = parse_field(&fields, 45)?;

    if price <= 0.0 {
        return None;
    }

    // HHMMSS resolved against today's date; malformed stamps fall back to now.
    let timestamp = fields
        .get(1)
        .filter(|s| s.len() >= 6)
        .and_then(|s| NaiveTime::parse_from_str(&s[..6], "%H%M%S").ok())
        .map(|t| now.date().and_time(t))
        .unwrap_or(now);

    Some(TickMessage {
        ticker: ticker.to_string(),
        price,
        volume,
        cum_vol,
        cum_val,
        vi_ref,
        timestamp,
    })
}

/// Parse an orderbook-top payload: ticker@0, best ask@3, best bid@13.
/// Requires at least 4 fields.
pub fn parse_askbid_message(data: &str) -> Option<AskBidMessage> {
    let fields: Vec<&str> = data.split('^').collect();
    if fields.len() < 4 {
        return None;
    }
    let ticker = fields[0];
    if ticker.is_empty() {
        return None;
    }
    let ask = parse_field(&fields, 3)?;
    let bid = parse_field(&fields, 13)?;
    Some(AskBidMessage {
        ticker: ticker.to_string(),
        bid,
        ask,
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type TickCallback = Box<dyn Fn(&TickMessage) + Send + Sync>;
type AskBidCallback = Box<dyn Fn(&AskBidMessage) + Send + Sync>;

/// Async WebSocket client for KIS realtime data.
pub struct KisWsClient {
    approval_key: String,
    custtype: String,
    url: RwLock<String>,
    state: RwLock<ConnState>,
    write: AsyncMutex<Option<WsSink>>,
    read: AsyncMutex<Option<WsSource>>,
    connected_since: parking_lot::Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    running: AtomicBool,
    tick_subs: RwLock<HashSet<String>>,
    asp_subs: RwLock<HashSet<String>>,
    tick_callbacks: RwLock<Vec<TickCallback>>,
    askbid_callbacks: RwLock<Vec<AskBidCallback>>,
}

impl KisWsClient {
    pub fn new(approval_key: impl Into<String>, custtype: impl Into<String>) -> Self {
        Self {
            approval_key: approval_key.into(),
            custtype: custtype.into(),
            url: RwLock::new(String::new()),
            state: RwLock::new(ConnState::Disconnected),
            write: AsyncMutex::new(None),
            read: AsyncMutex::new(None),
            connected_since: parking_lot::Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            running: AtomicBool::new(false),
            tick_subs: RwLock::new(HashSet::new()),
            asp_subs: RwLock::new(HashSet::new()),
            tick_callbacks: RwLock::new(Vec::new()),
            askbid_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Register a tick callback (append-only).
    pub fn on_tick(&self, cb: impl Fn(&TickMessage) + Send + Sync + 'static) {
        self.tick_callbacks.write().push(Box::new(cb));
    }

    /// Register an orderbook-top callback (append-only).
    pub fn on_askbid(&self, cb: impl Fn(&AskBidMessage) + Send + Sync + 'static) {
        self.askbid_callbacks.write().push(Box::new(cb));
    }

    pub fn tick_subs(&self) -> HashSet<String> {
        self.tick_subs.read().clone()
    }

    pub fn asp_subs(&self) -> HashSet<String> {
        self.asp_subs.read().clone()
    }

    /// Combined registration count.
    pub fn total_subs(&self) -> usize {
        self.tick_subs.read().len() + self.asp_subs.read().len()
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Open the WebSocket. Does NOT reset the reconnect counter — that only
    /// happens once the connection has proven stable in the read loop.
    pub async fn connect(&self, url: &str) -> bool {
        *self.url.write() = url.to_string();
        *self.state.write() = ConnState::Connecting;

        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok((stream, _response))) => {
                let (sink, source) = stream.split();
                *self.write.lock().await = Some(sink);
                *self.read.lock().await = Some(source);
                *self.connected_since.lock() = Some(Instant::now());
                *self.state.write() = ConnState::Connected;
                info!(url, "WebSocket connected");
                true
            }
            Ok(Err(e)) => {
                warn!(url, error = %e, "WebSocket connect failed");
                *self.state.write() = ConnState::Disconnected;
                false
            }
            Err(_) => {
                warn!(url, timeout_s = CONNECT_TIMEOUT.as_secs(), "WebSocket connect timed out");
                *self.state.write() = ConnState::Disconnected;
                false
            }
        }
    }

    /// Graceful close: drain, close the sink, drop both halves. Also stops
    /// any active `run` loop.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::Relaxed);
        *self.state.write() = ConnState::Draining;
        if let Some(mut sink) = self.write.lock().await.take() {
            let _ = sink.close().await;
        }
        *self.read.lock().await = None;
        *self.state.write() = ConnState::Disconnected;
        info!("WebSocket disconnected");
    }

    fn mark_disconnected(&self) {
        *self.state.write() = ConnState::Disconnected;
    }

    async fn send_text(&self, payload: String) -> anyhow::Result<()> {
        let mut guard = self.write.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(payload)).await?;
                Ok(())
            }
            None => anyhow::bail!("write half not available"),
        }
    }

    /// Broker-defined JSON subscribe/unsubscribe command.
    fn command_payload(&self, cmd: u8, ticker: &str) -> String {
        let (tr_id, tr_type) = match cmd {
            CMD_SUB_ASKBID => (TR_ASKBID, "1"),
            CMD_UNSUB_ASKBID => (TR_ASKBID, "2"),
            CMD_SUB_TICK => (TR_TICK, "1"),
            _ => (TR_TICK, "2"),
        };
        serde_json::json!({
            "header": {
                "approval_key": self.approval_key,
                "custtype": self.custtype,
                "tr_type": tr_type,
                "content-type": "utf-8",
            },
            "body": {
                "input": { "tr_id": tr_id, "tr_key": ticker }
            }
        })
        .to_string()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe the tick stream for a ticker. Idempotent; false when
    /// disconnected or the send fails.
    pub async fn subscribe_tick(&self, ticker: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.tick_subs.read().contains(ticker) {
            return true;
        }
        match self.send_text(self.command_payload(CMD_SUB_TICK, ticker)).await {
            Ok(()) => {
                self.tick_subs.write().insert(ticker.to_string());
                debug!(ticker, "subscribed tick stream");
                true
            }
            Err(e) => {
                error!(ticker, error = %e, "tick subscribe failed");
                false
            }
        }
    }

    /// Subscribe the orderbook-top stream for a ticker.
    pub async fn subscribe_askbid(&self, ticker: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.asp_subs.read().contains(ticker) {
            return true;
        }
        match self
            .send_text(self.command_payload(CMD_SUB_ASKBID, ticker))
            .await
        {
            Ok(()) => {
                self.asp_subs.write().insert(ticker.to_string());
                debug!(ticker, "subscribed orderbook-top stream");
                true
            }
            Err(e) => {
                error!(ticker, error = %e, "orderbook-top subscribe failed");
                false
            }
        }
    }

    /// Unsubscribe the tick stream. The set entry is dropped even when the
    /// wire command cannot be sent.
    pub async fn unsubscribe_tick(&self, ticker: &str) {
        let was_subscribed = self.tick_subs.write().remove(ticker);
        if !was_subscribed || !self.is_connected() {
            return;
        }
        if let Err(e) = self
            .send_text(self.command_payload(CMD_UNSUB_TICK, ticker))
            .await
        {
            error!(ticker, error = %e, "tick unsubscribe failed");
        }
    }

    /// Unsubscribe the orderbook-top stream.
    pub async fn unsubscribe_askbid(&self, ticker: &str) {
        let was_subscribed = self.asp_subs.write().remove(ticker);
        if !was_subscribed || !self.is_connected() {
            return;
        }
        if let Err(e) = self
            .send_text(self.command_payload(CMD_UNSUB_ASKBID, ticker))
            .await
        {
            error!(ticker, error = %e, "orderbook-top unsubscribe failed");
        }
    }

    /// Re-issue every tracked subscription after a reconnect. Tickers whose
    /// replay fails are removed so the budget manager can re-enqueue them.
    async fn replay_subscriptions(&self) {
        for ticker in self.tick_subs() {
            if let Err(e) = self
                .send_text(self.command_payload(CMD_SUB_TICK, &ticker))
                .await
            {
                warn!(ticker = %ticker, error = %e, "tick replay failed — dropping subscription");
                self.tick_subs.write().remove(&ticker);
            }
        }
        for ticker in self.asp_subs() {
            if let Err(e) = self
                .send_text(self.command_payload(CMD_SUB_ASKBID, &ticker))
                .await
            {
                warn!(ticker = %ticker, error = %e, "orderbook replay failed — dropping subscription");
                self.asp_subs.write().remove(&ticker);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Read loop
    // -------------------------------------------------------------------------

    /// Run the read/dispatch loop. Blocks until `disconnect` is called or,
    /// with `auto_reconnect` off, until the connection drops.
    pub async fn run(&self, auto_reconnect: bool) {
        self.running.store(true, Ordering::Relaxed);
        loop {
            if !self.running.load(Ordering::Relaxed) || self.state() == ConnState::Draining {
                break;
            }
            if !self.is_connected() {
                if !auto_reconnect {
                    break;
                }
                if !self.reconnect().await {
                    continue;
                }
            }

            let Some(mut source) = self.read.lock().await.take() else {
                self.mark_disconnected();
                continue;
            };

            self.read_until_closed(&mut source).await;
            self.mark_disconnected();

            if !auto_reconnect {
                break;
            }
        }
    }

    async fn read_until_closed(&self, source: &mut WsSource) {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // the first tick fires immediately
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() >= PONG_TIMEOUT {
                            warn!("pong timeout — treating connection as dead");
                            return;
                        }
                    }
                    let mut guard = self.write.lock().await;
                    match guard.as_mut() {
                        Some(sink) => {
                            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                return;
                            }
                            awaiting_pong = Some(Instant::now());
                        }
                        None => return,
                    }
                }
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.maybe_reset_backoff();
                        self.dispatch_frame(&text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let mut guard = self.write.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("WebSocket stream closed");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        return;
                    }
                }
            }
        }
    }

    /// Reset the backoff counter once the connection has proven stable.
    fn maybe_reset_backoff(&self) {
        if self.reconnect_attempts.load(Ordering::Relaxed) == 0 {
            return;
        }
        let since: Option<Instant> = *self.connected_since.lock();
        let stable = since
            .map(|s| s.elapsed() >= Duration::from_secs(STABLE_CONNECTION_SECS))
            .unwrap_or(false);
        if stable {
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            info!("connection stable — reconnect backoff reset");
        }
    }

    /// Exponential-backoff reconnect + subscription replay.
    async fn reconnect(&self) -> bool {
        let url = self.url.read().clone();
        if url.is_empty() {
            return false;
        }

        let attempts = self.reconnect_attempts.load(Ordering::Relaxed);
        let delay = (RECONNECT_DELAY_BASE_SECS * 2f64.powi(attempts.min(16) as i32))
            .min(RECONNECT_DELAY_MAX_SECS);
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(delay_s = delay, attempt = attempts + 1, "reconnecting WebSocket");
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;

        if self.connect(&url).await {
            self.replay_subscriptions().await;
            true
        } else {
            false
        }
    }

    /// Parse one frame and fan out to callbacks. Malformed frames are logged
    /// at debug and dropped; a panicking callback is contained so it cannot
    /// take down the dispatch loop.
    fn dispatch_frame(&self, raw: &str) {
        let Some((tr_id, data)) = parse_ws_frame(raw) else {
            debug!("dropping malformed frame");
            return;
        };
        let now = Local::now().naive_local();

        match tr_id.as_str() {
            TR_TICK => match parse_tick_message(&data, now) {
                Some(msg) => {
                    for cb in self.tick_callbacks.read().iter() {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| cb(&msg))).is_err() {
                            error!(ticker = %msg.ticker, "tick callback panicked");
                        }
                    }
                }
                None => debug!("dropping malformed tick payload"),
            },
            TR_ASKBID => match parse_askbid_message(&data) {
                Some(msg) => {
                    for cb in self.askbid_callbacks.read().iter() {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| cb(&msg))).is_err() {
                            error!(ticker = %msg.ticker, "orderbook callback panicked");
                        }
                    }
                }
                None => debug!("dropping malformed orderbook payload"),
            },
            _ => {}
        }
    }
}

impl std::fmt::Debug for KisWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisWsClient")
            .field("state", &self.state())
            .field("tick_subs", &self.tick_subs.read().len())
            .field("asp_subs", &self.asp_subs.read().len())
            .field("approval_key", &"<redacted>")
            .finish()
    }
}

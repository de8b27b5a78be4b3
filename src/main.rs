// =============================================================================
// KIS Nexus — Main Entry Point
// =============================================================================
//
// Wires the execution substrate together: authenticated environment, shared
// rate budget, REST client, WebSocket streams, and the per-symbol engine,
// then runs the session loops until Ctrl+C.
//
// Scheduling model: the WebSocket read loop owns all tick dispatch; order
// intents cross to a dedicated executor task over a bounded channel; the
// regime poller, OMS reconciler, equity refresher, and session timer run as
// independent tasks. Shared state lives behind parking_lot locks that are
// never held across an await.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engine;
mod kis;
mod market;
mod rate;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::KisConfig;
use crate::engine::dispatch;
use crate::engine::exposure::SectorExposure;
use crate::engine::fsm::{self, FsmAction, FsmContext};
use crate::engine::reconcile::run_reconcile_loop;
use crate::engine::regime::{run_program_poll, MarketProgramRegime};
use crate::engine::scanner::{apply_trend_anchor, scan_value_surge};
use crate::engine::state::SymbolState;
use crate::engine::universe::filter_universe;
use crate::kis::auth::KisEnv;
use crate::kis::client::KisClient;
use crate::kis::subs::SubscriptionManager;
use crate::kis::ws::KisWsClient;
use crate::market::bars::Bar;
use crate::market::calendar::TradingCalendar;
use crate::rate::bucket::{epoch_now, PriorityWindows};
use crate::rate::shared::SharedRateBudget;

/// 15-minute slots in one KRX cash session (09:00–15:30).
const SESSION_15M_SLOTS: f64 = 26.0;
/// Minutes in one KRX cash session.
const SESSION_MINUTES: f64 = 390.0;
/// Capacity of the intent channel between dispatch and the executor.
const INTENT_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("KIS Nexus starting up");

    let config_path =
        std::env::var("KIS_NEXUS_CONFIG").unwrap_or_else(|_| "kis_config.json".into());
    let cfg = KisConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "config load failed — using defaults");
        KisConfig::default()
    });

    let calendar = TradingCalendar::new(cfg.holidays.iter().copied());
    let today = Local::now().date_naive();
    if !calendar.is_trading_day(today) {
        info!(%today, "not a trading day — exiting");
        return Ok(());
    }

    // ── 2. Auth + shared rate budget + REST client ───────────────────────
    let env = Arc::new(KisEnv::connect(&cfg).await?);
    let windows = Arc::new(PriorityWindows::new(cfg.priority_windows.clone()));
    let budget = Arc::new(SharedRateBudget::new(
        cfg.shared_state_file.clone(),
        windows,
        &cfg.rate_overrides,
    ));
    let client = Arc::new(KisClient::new(env.clone(), budget.clone(), &cfg));

    // ── 3. Universe filter + per-symbol state ────────────────────────────
    let (valid, rejections) =
        filter_universe(client.as_ref(), &cfg.symbols, &cfg.universe).await;
    for rejection in &rejections {
        debug!(ticker = %rejection.ticker, reason = %rejection.reason, value = rejection.value, "rejected from universe");
    }

    let mut state_map: HashMap<String, SymbolState> = valid
        .iter()
        .map(|t| {
            let sector = cfg.sector_map.get(t).cloned().unwrap_or_default();
            (t.clone(), SymbolState::new(t, sector))
        })
        .collect();

    // ── 4. Premarket anchors + baselines ─────────────────────────────────
    let mut daily: HashMap<String, Vec<Bar>> = HashMap::new();
    let mut baseline_15m: HashMap<String, f64> = HashMap::new();
    for ticker in &valid {
        match client.get_daily_bars(ticker).await {
            Ok(bars) => {
                let tail: Vec<&Bar> = bars.iter().rev().take(20).collect();
                if !tail.is_empty() {
                    let adv: f64 =
                        tail.iter().map(|b| b.close * b.volume).sum::<f64>() / tail.len() as f64;
                    baseline_15m.insert(ticker.clone(), adv / SESSION_15M_SLOTS);
                    let avg_vol: f64 =
                        tail.iter().map(|b| b.volume).sum::<f64>() / tail.len() as f64;
                    if let Some(s) = state_map.get_mut(ticker) {
                        s.avg_1m_vol = avg_vol / SESSION_MINUTES;
                    }
                }
                daily.insert(ticker.clone(), bars);
            }
            Err(e) => warn!(ticker = %ticker, error = %e, "daily bars unavailable"),
        }
    }
    apply_trend_anchor(&mut state_map, &daily);
    info!(
        tracked = state_map.len(),
        trending = state_map.values().filter(|s| s.trend_ok).count(),
        "premarket anchors applied"
    );

    // ── 5. Shared engine state ───────────────────────────────────────────
    let states = Arc::new(RwLock::new(state_map));
    let exposure = Arc::new(RwLock::new(SectorExposure::new(
        cfg.sector_map.clone(),
        cfg.exposure.clone(),
    )));
    let regime = Arc::new(RwLock::new(MarketProgramRegime::default()));
    let last_prices = Arc::new(RwLock::new(HashMap::<String, f64>::new()));
    let equity = Arc::new(RwLock::new(0.0_f64));
    let risk_off = Arc::new(AtomicBool::new(false));
    let or_locked = Arc::new(AtomicBool::new(false));
    let switches = Arc::new(cfg.switches.clone());

    let (intent_tx, mut intent_rx) =
        tokio::sync::mpsc::channel::<FsmAction>(INTENT_QUEUE_DEPTH);

    // ── 6. WebSocket client + dispatch callbacks ─────────────────────────
    let ws = Arc::new(KisWsClient::new(env.approval_key(), cfg.custtype.clone()));

    {
        let states = states.clone();
        let exposure = exposure.clone();
        let regime = regime.clone();
        let last_prices = last_prices.clone();
        let equity = equity.clone();
        let risk_off = risk_off.clone();
        let or_locked = or_locked.clone();
        let switches = switches.clone();
        let intent_tx = intent_tx.clone();
        ws.on_tick(move |msg| {
            let now_epoch = epoch_now();
            let now_local = Local::now().naive_local();

            let action = {
                let mut states = states.write();
                let Some(s) = states.get_mut(&msg.ticker) else {
                    return;
                };
                dispatch::on_tick(s, msg, now_epoch, or_locked.load(Ordering::Relaxed));
                last_prices.write().insert(msg.ticker.clone(), msg.price);

                let regime = regime.read();
                let label = regime.regime();
                let ctx = FsmContext {
                    switches: &switches,
                    regime: label.as_str(),
                    program_mult: label.multiplier(),
                    equity: *equity.read(),
                    risk_off: risk_off.load(Ordering::Relaxed),
                    regime_breadth_ok: true,
                    not_chop: true,
                    now: now_local,
                    now_epoch,
                };
                fsm::on_price_tick(s, &mut exposure.write(), msg.price, &ctx)
            };

            if !matches!(action, FsmAction::None) {
                if let Err(e) = intent_tx.try_send(action) {
                    error!(error = %e, "intent queue full — dropping action");
                }
            }
        });
    }

    {
        let states = states.clone();
        ws.on_askbid(move |msg| {
            let mut states = states.write();
            if let Some(s) = states.get_mut(&msg.ticker) {
                dispatch::on_askbid(s, msg);
            }
        });
    }

    let subs = Arc::new(SubscriptionManager::new(ws.clone()));

    // ── 7. WebSocket run loop ────────────────────────────────────────────
    {
        let ws = ws.clone();
        let url = cfg.websocket_url.clone();
        tokio::spawn(async move {
            if !url.is_empty() && ws.connect(&url).await {
                info!("realtime stream online");
            }
            ws.run(true).await;
        });
    }

    // ── 8. Intent executor ───────────────────────────────────────────────
    {
        let client = client.clone();
        let states = states.clone();
        let exposure = exposure.clone();
        tokio::spawn(async move {
            while let Some(action) = intent_rx.recv().await {
                match action {
                    FsmAction::SubmitEntry(intent) => match client.place_order(&intent).await {
                        Ok(order_id) => {
                            info!(symbol = %intent.symbol, order_id = %order_id, "entry order submitted");
                            if let Some(s) = states.write().get_mut(&intent.symbol) {
                                s.entry_order_id = Some(order_id);
                            }
                        }
                        Err(e) => {
                            warn!(symbol = %intent.symbol, class = e.class(), error = %e, "entry order failed");
                            let mut states = states.write();
                            let mut exposure = exposure.write();
                            if let Some(s) = states.get_mut(&intent.symbol) {
                                fsm::on_entry_rejected(s, &mut exposure, intent.limit_px);
                            }
                        }
                    },
                    FsmAction::SubmitExit(intent, reason) => {
                        match client.place_order(&intent).await {
                            Ok(order_id) => {
                                info!(symbol = %intent.symbol, %reason, order_id = %order_id, "exit order submitted");
                            }
                            Err(e) => {
                                // The exit must not be lost: put the symbol
                                // back so the next tick re-triggers it.
                                error!(symbol = %intent.symbol, %reason, class = e.class(), error = %e, "exit order failed — will retry");
                                if let Some(s) = states.write().get_mut(&intent.symbol) {
                                    s.fsm = crate::engine::state::FsmState::InPosition;
                                }
                            }
                        }
                    }
                    FsmAction::None => {}
                }
            }
        });
    }

    // ── 9. Regime poller ─────────────────────────────────────────────────
    {
        let client = client.clone();
        let regime = regime.clone();
        tokio::spawn(async move {
            run_program_poll(client.as_ref(), regime).await;
        });
    }

    // ── 10. OMS reconciler ───────────────────────────────────────────────
    {
        let client = client.clone();
        let states = states.clone();
        let exposure = exposure.clone();
        tokio::spawn(async move {
            run_reconcile_loop(client.as_ref(), states, exposure).await;
        });
    }

    // ── 11. Equity refresher ─────────────────────────────────────────────
    {
        let client = client.clone();
        let equity = equity.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match client.get_balance_sheet().await {
                    Ok((_positions, account_equity)) => {
                        *equity.write() = account_equity;
                    }
                    Err(e) => debug!(error = %e, "equity refresh failed"),
                }
            }
        });
    }

    // ── 12. Session timer: scan → OR lock → focus → cutoff → flatten ─────
    {
        let client = client.clone();
        let budget = budget.clone();
        let states = states.clone();
        let subs = subs.clone();
        let switches = switches.clone();
        let risk_off = risk_off.clone();
        let or_locked = or_locked.clone();
        let last_prices = last_prices.clone();
        let strategy_id = cfg.strategy_id.clone();
        let universe = valid.clone();

        tokio::spawn(async move {
            let at = |hm: (u32, u32)| NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("valid time");
            let or_lock_at = at(engine::params::OR_LOCK_TIME);
            let cutoff_at = at(engine::params::ENTRY_CUTOFF);
            let flatten_at = at(engine::params::FLATTEN_TIME);
            let mut scanned = false;
            let mut released = false;

            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let now = Local::now().time();

                if !scanned && now >= or_lock_at {
                    scanned = true;

                    // No stream subscriptions exist yet, so taking the map
                    // out for the await-heavy scan cannot lose ticks.
                    let mut map = std::mem::take(&mut *states.write());
                    let promoted = scan_value_surge(
                        client.as_ref(),
                        &universe,
                        &baseline_15m,
                        &mut map,
                        3.0,
                        40,
                        Some(budget.as_ref()),
                        &strategy_id,
                    )
                    .await;

                    let mut watching = 0;
                    for ticker in &promoted {
                        if let Some(s) = map.get_mut(ticker) {
                            if fsm::lock_opening_range(s, &switches) {
                                watching += 1;
                            }
                        }
                    }
                    *states.write() = map;
                    or_locked.store(true, Ordering::Relaxed);
                    info!(candidates = promoted.len(), watching, "opening ranges locked");

                    for ticker in &promoted {
                        if !subs.ensure_tick(ticker).await {
                            warn!(ticker = %ticker, "stream budget exhausted — symbol not subscribed");
                        }
                    }
                }

                if scanned {
                    let snapshot = states.read().clone();
                    let prices = last_prices.read().clone();
                    subs.refresh_focus_list(&snapshot, &prices).await;
                }

                if !released && now >= cutoff_at {
                    released = true;
                    let snapshot = states.read().clone();
                    subs.release_non_position_slots(&snapshot).await;
                }

                if now >= flatten_at && !risk_off.load(Ordering::Relaxed) {
                    risk_off.store(true, Ordering::Relaxed);
                    info!("flatten time reached — risk off");
                }
            }
        });
    }

    info!("all subsystems running — Ctrl+C to stop");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");
    ws.disconnect().await;
    info!("KIS Nexus shut down");
    Ok(())
}

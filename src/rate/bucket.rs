// =============================================================================
// Token Bucket + Priority Windows — capacity/refill with time-based priority
// =============================================================================
//
// The plain bucket refills continuously at `refill_rate` tokens per second up
// to `capacity`. The priority variant divides the consume cost by a
// per-strategy multiplier: during a strategy's configured wall-clock window
// it pays half cost (BOOST), everyone else pays double (PENALTY). Outside
// any window all strategies pay face value.
//
// `try_consume` never blocks and never suspends; the mutex is held for the
// whole refill+consume step so `0 <= tokens <= capacity` holds at every
// observation.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Cost divisor for the strategy that owns the current priority window.
pub const PRIORITY_BOOST: f64 = 2.0;
/// Cost divisor for every other strategy while a window is active.
pub const PRIORITY_PENALTY: f64 = 0.5;

/// Wall-clock seconds since the UNIX epoch.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Core bucket state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct BucketCore {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: f64,
}

impl BucketCore {
    fn new(capacity: u32, refill_rate: f64, now: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Plain token bucket
// ---------------------------------------------------------------------------

/// Thread-safe token bucket. Consumption fails immediately when the bucket
/// holds fewer tokens than the requested cost.
#[derive(Debug)]
pub struct TokenBucket {
    core: Mutex<BucketCore>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            core: Mutex::new(BucketCore::new(capacity, refill_rate, epoch_now())),
        }
    }

    /// Try to consume `cost` tokens at the current wall-clock time.
    pub fn try_consume(&self, cost: f64) -> bool {
        self.try_consume_at(cost, epoch_now())
    }

    /// Clock-injected variant for deterministic tests.
    pub fn try_consume_at(&self, cost: f64, now: f64) -> bool {
        let mut core = self.core.lock();
        core.refill(now);
        core.try_take(cost)
    }

    /// Tokens currently available (after refilling to `now`).
    pub fn available_at(&self, now: f64) -> f64 {
        let mut core = self.core.lock();
        core.refill(now);
        core.tokens
    }

    pub fn available(&self) -> f64 {
        self.available_at(epoch_now())
    }

    pub fn capacity(&self) -> f64 {
        self.core.lock().capacity
    }
}

// ---------------------------------------------------------------------------
// Priority windows
// ---------------------------------------------------------------------------

/// Static table of strategy → half-open `[start, end)` local-time windows.
/// Strategy ids are matched case-insensitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityWindows {
    windows: BTreeMap<String, Vec<(NaiveTime, NaiveTime)>>,
}

impl PriorityWindows {
    pub fn new(windows: BTreeMap<String, Vec<(NaiveTime, NaiveTime)>>) -> Self {
        let windows = windows
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        Self { windows }
    }

    /// Single-window convenience constructor.
    pub fn single(strategy: &str, start: NaiveTime, end: NaiveTime) -> Self {
        let mut map = BTreeMap::new();
        map.insert(strategy.to_uppercase(), vec![(start, end)]);
        Self { windows: map }
    }

    /// The strategy whose window contains local time `t`, if any.
    pub fn active_strategy_at(&self, t: NaiveTime) -> Option<&str> {
        // Minute resolution: windows are configured on minute boundaries.
        let t = t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t);
        for (strategy, windows) in &self.windows {
            for &(start, end) in windows {
                if start <= t && t < end {
                    return Some(strategy);
                }
            }
        }
        None
    }

    /// Cost multiplier for `strategy` at local time `t`.
    pub fn multiplier_at(&self, strategy: &str, t: NaiveTime) -> f64 {
        match self.active_strategy_at(t) {
            None => 1.0,
            Some(active) if active == strategy.to_uppercase() => PRIORITY_BOOST,
            Some(_) => PRIORITY_PENALTY,
        }
    }
}

/// Introspection record for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityStatus {
    pub strategy_id: String,
    pub active_priority_strategy: Option<String>,
    pub multiplier: f64,
    pub is_priority: bool,
}

// ---------------------------------------------------------------------------
// Priority-aware bucket
// ---------------------------------------------------------------------------

/// Token bucket whose effective cost is `cost / multiplier` for the calling
/// strategy, per the shared priority-window table.
#[derive(Debug)]
pub struct PriorityTokenBucket {
    core: Mutex<BucketCore>,
    windows: Arc<PriorityWindows>,
}

impl PriorityTokenBucket {
    pub fn new(capacity: u32, refill_rate: f64, windows: Arc<PriorityWindows>) -> Self {
        Self {
            core: Mutex::new(BucketCore::new(capacity, refill_rate, epoch_now())),
            windows,
        }
    }

    /// Try to consume for `strategy` at the current wall clock.
    pub fn try_consume(&self, cost: f64, strategy: &str) -> bool {
        self.try_consume_at(cost, strategy, epoch_now(), Local::now().time())
    }

    /// Clock-injected variant: `now` drives refill, `local` drives the
    /// priority multiplier.
    pub fn try_consume_at(&self, cost: f64, strategy: &str, now: f64, local: NaiveTime) -> bool {
        let multiplier = self.windows.multiplier_at(strategy, local);
        let effective = cost / multiplier;
        let mut core = self.core.lock();
        core.refill(now);
        core.try_take(effective)
    }

    /// Tokens available to `strategy` (raw tokens scaled by its multiplier).
    pub fn available_tokens(&self, strategy: &str) -> f64 {
        self.available_tokens_at(strategy, epoch_now(), Local::now().time())
    }

    pub fn available_tokens_at(&self, strategy: &str, now: f64, local: NaiveTime) -> f64 {
        let multiplier = self.windows.multiplier_at(strategy, local);
        let mut core = self.core.lock();
        core.refill(now);
        core.tokens * multiplier
    }

    /// Current priority status for `strategy`.
    pub fn priority_status(&self, strategy: &str) -> PriorityStatus {
        self.priority_status_at(strategy, Local::now().time())
    }

    pub fn priority_status_at(&self, strategy: &str, local: NaiveTime) -> PriorityStatus {
        let active = self.windows.active_strategy_at(local).map(str::to_string);
        let multiplier = self.windows.multiplier_at(strategy, local);
        PriorityStatus {
            strategy_id: strategy.to_uppercase(),
            is_priority: active.as_deref() == Some(strategy.to_uppercase().as_str()),
            active_priority_strategy: active,
            multiplier,
        }
    }

    /// Raw state for cross-process synchronization:
    /// `(tokens, last_refill, capacity, refill_rate)`.
    pub(crate) fn snapshot(&self) -> (f64, f64, f64, f64) {
        let core = self.core.lock();
        (core.tokens, core.last_refill, core.capacity, core.refill_rate)
    }

    /// Overwrite tokens and refill timestamp from an external snapshot.
    pub(crate) fn restore(&self, tokens: f64, last_refill: f64) {
        let mut core = self.core.lock();
        core.tokens = tokens.clamp(0.0, core.capacity);
        core.last_refill = last_refill;
    }
}

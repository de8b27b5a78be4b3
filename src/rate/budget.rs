// =============================================================================
// Rate Budget — per-endpoint-class token bucket dispatch (in-process)
// =============================================================================
//
// Every REST operation is tagged with an endpoint class; each class owns a
// priority-aware bucket. Consumption is non-blocking: when the bucket is
// empty the call fails immediately with `KisError::RateLimited` and retry is
// the caller's responsibility.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::types::KisError;

use super::bucket::{PriorityTokenBucket, PriorityWindows};

/// REST endpoint classes with independent budgets. Unknown class names route
/// to `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointClass {
    Quote,
    Chart,
    Flow,
    Order,
    Balance,
    Default,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 6] = [
        EndpointClass::Quote,
        EndpointClass::Chart,
        EndpointClass::Flow,
        EndpointClass::Order,
        EndpointClass::Balance,
        EndpointClass::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Quote => "QUOTE",
            EndpointClass::Chart => "CHART",
            EndpointClass::Flow => "FLOW",
            EndpointClass::Order => "ORDER",
            EndpointClass::Balance => "BALANCE",
            EndpointClass::Default => "DEFAULT",
        }
    }

    /// Parse a class name; anything unrecognized becomes `Default`.
    pub fn parse(name: &str) -> Self {
        match name.to_uppercase().as_str() {
            "QUOTE" => EndpointClass::Quote,
            "CHART" => EndpointClass::Chart,
            "FLOW" => EndpointClass::Flow,
            "ORDER" => EndpointClass::Order,
            "BALANCE" => EndpointClass::Balance,
            _ => EndpointClass::Default,
        }
    }

    /// Default `(capacity, refill_rate)` per class.
    pub fn default_budget(&self) -> (u32, f64) {
        match self {
            EndpointClass::Quote => (60, 1.0),
            EndpointClass::Chart => (30, 0.5),
            EndpointClass::Flow => (20, 0.33),
            EndpointClass::Order => (30, 0.5),
            EndpointClass::Balance => (20, 0.33),
            EndpointClass::Default => (30, 0.5),
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-process rate budget: one priority bucket per endpoint class.
pub struct RateBudget {
    buckets: HashMap<EndpointClass, PriorityTokenBucket>,
}

impl RateBudget {
    /// Build with default budgets for every class.
    pub fn new(windows: Arc<PriorityWindows>) -> Self {
        Self::with_overrides(windows, &HashMap::new())
    }

    /// Build with `class name → (capacity, refill_rate)` overrides. Unknown
    /// override names are reported and ignored (they would silently feed the
    /// DEFAULT class otherwise).
    pub fn with_overrides(
        windows: Arc<PriorityWindows>,
        overrides: &HashMap<String, (u32, f64)>,
    ) -> Self {
        let mut resolved: HashMap<EndpointClass, (u32, f64)> = EndpointClass::ALL
            .iter()
            .map(|c| (*c, c.default_budget()))
            .collect();

        for (name, budget) in overrides {
            let class = EndpointClass::parse(name);
            if class == EndpointClass::Default && name.to_uppercase() != "DEFAULT" {
                warn!(class = %name, "unknown rate-budget override class ignored");
                continue;
            }
            resolved.insert(class, *budget);
        }

        let buckets = resolved
            .into_iter()
            .map(|(class, (cap, rate))| {
                (class, PriorityTokenBucket::new(cap, rate, windows.clone()))
            })
            .collect();

        Self { buckets }
    }

    /// The bucket backing `class` (always present).
    pub fn bucket(&self, class: EndpointClass) -> &PriorityTokenBucket {
        self.buckets
            .get(&class)
            .unwrap_or_else(|| &self.buckets[&EndpointClass::Default])
    }

    /// Try to consume `cost` tokens from the class bucket.
    pub fn try_consume(&self, class: EndpointClass, strategy: &str, cost: f64) -> bool {
        self.bucket(class).try_consume(cost, strategy)
    }

    /// Run `op` under the class budget. Fails fast with `RateLimited` when
    /// the bucket is empty — never blocks or sleeps.
    pub async fn call_rest<T, F, Fut>(
        &self,
        class: EndpointClass,
        strategy: &str,
        cost: f64,
        op: F,
    ) -> Result<T, KisError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, KisError>>,
    {
        if !self.try_consume(class, strategy, cost) {
            return Err(KisError::RateLimited(format!(
                "{class} budget exhausted for {strategy}"
            )));
        }
        op().await
    }
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBudget")
            .field("classes", &self.buckets.len())
            .finish()
    }
}

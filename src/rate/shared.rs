// =============================================================================
// Shared Rate Budget — cross-process bucket state via a file-locked JSON map
// =============================================================================
//
// Multiple strategy processes coordinate through a single state file holding
// `class -> {tokens, last_refill, capacity, refill_rate}`. Every consume is
// one open → lock → read → mutate → write → unlock transaction; the advisory
// lock is always released on every exit path. When the file cannot be opened
// or locked the call degrades to in-memory single-process semantics with a
// warning. Cross-process fairness is whatever the OS lock queue provides.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::KisError;

use super::bucket::{PriorityTokenBucket, PriorityWindows};
use super::budget::{EndpointClass, RateBudget};

/// Serialized per-class bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SharedBucketState {
    tokens: f64,
    last_refill: f64,
    capacity: u32,
    refill_rate: f64,
}

/// Priority rate budget shared across cooperating processes.
pub struct SharedRateBudget {
    inner: RateBudget,
    state_path: Option<PathBuf>,
    // Serializes file transactions within this process; the advisory file
    // lock serializes across processes.
    io_lock: Mutex<()>,
}

impl SharedRateBudget {
    /// Create a shared budget. `state_path = None` keeps coordination
    /// in-memory only (single process).
    pub fn new(
        state_path: Option<PathBuf>,
        windows: Arc<PriorityWindows>,
        overrides: &HashMap<String, (u32, f64)>,
    ) -> Self {
        let budget = Self {
            inner: RateBudget::with_overrides(windows, overrides),
            state_path,
            io_lock: Mutex::new(()),
        };

        if let Some(path) = budget.state_path.clone() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(
                        path = %parent.display(),
                        error = %e,
                        "cannot create rate-budget state directory — running in-memory"
                    );
                }
            }
            if !path.exists() {
                if let Err(e) = budget.initialize_state_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to seed state file");
                }
            }
        }

        budget
    }

    /// In-memory-only constructor.
    pub fn in_memory(windows: Arc<PriorityWindows>) -> Self {
        Self::new(None, windows, &HashMap::new())
    }

    /// The bucket backing `class` (test/introspection access).
    pub fn bucket(&self, class: EndpointClass) -> &PriorityTokenBucket {
        self.inner.bucket(class)
    }

    /// Try to consume `cost` tokens for `strategy` from the class bucket,
    /// synchronizing through the state file when configured.
    pub fn try_consume(&self, class: EndpointClass, strategy: &str, cost: f64) -> bool {
        match self.state_path.clone() {
            Some(path) => {
                let _guard = self.io_lock.lock();
                match self.consume_locked(&path, class, strategy, cost) {
                    Ok(granted) => granted,
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "shared rate-budget file unavailable — in-memory fallback"
                        );
                        self.inner.try_consume(class, strategy, cost)
                    }
                }
            }
            None => self.inner.try_consume(class, strategy, cost),
        }
    }

    /// Run `op` under the shared budget; fails fast with `RateLimited`.
    pub async fn call_rest<T, F, Fut>(
        &self,
        class: EndpointClass,
        strategy: &str,
        cost: f64,
        op: F,
    ) -> Result<T, KisError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, KisError>>,
    {
        if !self.try_consume(class, strategy, cost) {
            return Err(KisError::RateLimited(format!(
                "{class} budget exhausted for {strategy}"
            )));
        }
        op().await
    }

    // -------------------------------------------------------------------------
    // File transaction
    // -------------------------------------------------------------------------

    /// One lock-read-mutate-write-unlock transaction. The lock is released
    /// on every exit path before the result propagates.
    fn consume_locked(
        &self,
        path: &Path,
        class: EndpointClass,
        strategy: &str,
        cost: f64,
    ) -> anyhow::Result<bool> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;

        let result = self.consume_under_lock(&mut file, class, strategy, cost);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn consume_under_lock(
        &self,
        file: &mut File,
        class: EndpointClass,
        strategy: &str,
        cost: f64,
    ) -> anyhow::Result<bool> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        self.sync_from_contents(&contents);

        let granted = self.inner.try_consume(class, strategy, cost);

        let serialized = serde_json::to_string(&self.state_map())?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;

        Ok(granted)
    }

    /// Overwrite in-memory bucket state from a serialized state map. Corrupt
    /// or empty contents leave the in-memory state untouched.
    fn sync_from_contents(&self, contents: &str) {
        if contents.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<HashMap<String, SharedBucketState>>(contents) {
            Ok(states) => {
                for class in EndpointClass::ALL {
                    if let Some(state) = states.get(class.as_str()) {
                        self.inner.bucket(class).restore(state.tokens, state.last_refill);
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "ignoring corrupt rate-budget state file");
            }
        }
    }

    fn state_map(&self) -> HashMap<String, SharedBucketState> {
        EndpointClass::ALL
            .iter()
            .map(|class| {
                let (tokens, last_refill, capacity, refill_rate) =
                    self.inner.bucket(*class).snapshot();
                (
                    class.as_str().to_string(),
                    SharedBucketState {
                        tokens,
                        last_refill,
                        capacity: capacity as u32,
                        refill_rate,
                    },
                )
            })
            .collect()
    }

    fn initialize_state_file(&self, path: &Path) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        let result = (|| -> anyhow::Result<()> {
            let serialized = serde_json::to_string(&self.state_map())?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(serialized.as_bytes())?;
            file.flush()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

impl std::fmt::Debug for SharedRateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRateBudget")
            .field("state_path", &self.state_path)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn no_refill_overrides() -> HashMap<String, (u32, f64)> {
        EndpointClass::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), (5u32, 0.0)))
            .collect()
    }

    fn windows() -> Arc<PriorityWindows> {
        Arc::new(PriorityWindows::default())
    }

    #[test]
    fn state_file_seeded_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.json");
        let _budget = SharedRateBudget::new(Some(path.clone()), windows(), &no_refill_overrides());

        let contents = std::fs::read_to_string(&path).unwrap();
        let states: HashMap<String, SharedBucketState> =
            serde_json::from_str(&contents).unwrap();
        assert_eq!(states.len(), EndpointClass::ALL.len());
        assert_eq!(states["QUOTE"].capacity, 5);
        assert_eq!(states["QUOTE"].tokens, 5.0);
    }

    #[test]
    fn consume_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.json");
        let budget = SharedRateBudget::new(Some(path.clone()), windows(), &no_refill_overrides());

        assert!(budget.try_consume(EndpointClass::Quote, "KMP", 2.0));

        let contents = std::fs::read_to_string(&path).unwrap();
        let states: HashMap<String, SharedBucketState> =
            serde_json::from_str(&contents).unwrap();
        assert!((states["QUOTE"].tokens - 3.0).abs() < 1e-9);
    }

    #[test]
    fn second_instance_observes_drained_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.json");
        let overrides = no_refill_overrides();

        let a = SharedRateBudget::new(Some(path.clone()), windows(), &overrides);
        for _ in 0..5 {
            assert!(a.try_consume(EndpointClass::Order, "KMP", 1.0));
        }
        assert!(!a.try_consume(EndpointClass::Order, "KMP", 1.0));

        // A fresh "process" starts with full in-memory buckets but must sync
        // the drained state from the file before consuming.
        let b = SharedRateBudget::new(Some(path), windows(), &overrides);
        assert!(!b.try_consume(EndpointClass::Order, "KMP", 1.0));
        // Other classes are untouched.
        assert!(b.try_consume(EndpointClass::Quote, "KMP", 1.0));
    }

    #[test]
    fn unlockable_path_falls_back_to_memory() {
        // Pointing the state path at a directory makes open() fail; the
        // consume must still be served from the in-memory bucket.
        let dir = tempfile::tempdir().unwrap();
        let budget = SharedRateBudget::new(
            Some(dir.path().to_path_buf()),
            windows(),
            &no_refill_overrides(),
        );
        for _ in 0..5 {
            assert!(budget.try_consume(EndpointClass::Quote, "KMP", 1.0));
        }
        assert!(!budget.try_consume(EndpointClass::Quote, "KMP", 1.0));
    }

    #[test]
    fn corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.json");
        std::fs::write(&path, "not json at all").unwrap();

        let budget =
            SharedRateBudget::new(Some(path.clone()), windows(), &no_refill_overrides());
        // In-memory full bucket serves the call and rewrites the file.
        assert!(budget.try_consume(EndpointClass::Quote, "KMP", 1.0));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<HashMap<String, SharedBucketState>>(&contents).is_ok());
    }

    #[tokio::test]
    async fn call_rest_rate_limits() {
        let budget = SharedRateBudget::new(None, windows(), &no_refill_overrides());
        for _ in 0..5 {
            assert!(budget.try_consume(EndpointClass::Flow, "KMP", 1.0));
        }
        let res: Result<(), KisError> = budget
            .call_rest(EndpointClass::Flow, "KMP", 1.0, || async { Ok(()) })
            .await;
        assert!(matches!(res, Err(KisError::RateLimited(_))));
    }
}

//! The build scheduler (§4.4): per-key build dedup, the 2-second cooldown,
//! and the blocking-initial-build gate that request handling awaits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, Mutex};

use crate::builder::BuildResult;
use crate::registry::ALL_KEY;

pub const COOLDOWN: Duration = Duration::from_secs(2);

/// The in-progress-build map key, per §4.4: `src` alone for the sentinel
/// result, else `src\nrequestPath`.
pub fn build_key(src: &str, result_key: &str) -> String {
    if result_key == ALL_KEY {
        src.to_string()
    } else {
        format!("{src}\n{result_key}")
    }
}

type BuildOutcome = Result<BuildResult, String>;

/// Deduplicates concurrent builds for the same key and applies the
/// rebuild cooldown.
pub struct BuildScheduler {
    in_progress: Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, Arc<BuildOutcome>>>>>>,
    pub gate: BlockingGate,
}

impl BuildScheduler {
    pub fn new() -> Self {
        Self {
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            gate: BlockingGate::new(),
        }
    }

    /// Run `build_fn` for `key`.
    ///
    /// - If a build is already in progress for `key`, await its shared
    ///   future instead of starting a new one.
    /// - If `last_build` is within the cooldown window, skip the rebuild
    ///   entirely (returns `None`).
    ///
    /// The caller is responsible for clearing stale outputs from the
    /// build result *before* calling this (§4.4 "teardown on rebuild") —
    /// the scheduler only owns concurrency and cooldown, not storage.
    pub async fn schedule<F, Fut>(
        &self,
        key: String,
        last_build: Option<Instant>,
        build_fn: F,
    ) -> Option<Arc<BuildOutcome>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<BuildResult>> + Send + 'static,
    {
        if let Some(last) = last_build {
            let elapsed = last.elapsed();
            if elapsed < COOLDOWN {
                tracing::debug!(
                    key,
                    remaining = %humantime::format_duration(COOLDOWN - elapsed),
                    "rebuild skipped, still in cooldown"
                );
                return None;
            }
        }

        let shared = {
            let mut guard = self.in_progress.lock().await;
            if let Some(shared) = guard.get(&key) {
                shared.clone()
            } else {
                let map = self.in_progress.clone();
                let remove_key = key.clone();
                let fut: BoxFuture<'static, Arc<BuildOutcome>> = async move {
                    let outcome: BuildOutcome = match build_fn().await {
                        Ok(result) => Ok(result),
                        Err(err) => {
                            tracing::error!(key = %remove_key, error = %format!("{err:#}"), "build failed");
                            Err(format!("{err:#}"))
                        }
                    };
                    map.lock().await.remove(&remove_key);
                    Arc::new(outcome)
                }
                .boxed();
                let shared = fut.shared();
                guard.insert(key, shared.clone());
                shared
            }
        };

        Some(shared.await)
    }
}

impl Default for BuildScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The blocking-build gate (§4.4): while one or more initial builds are
/// outstanding, request handling awaits `wait()` before routing. Built on
/// a `watch` channel rather than `Notify` so a late-arriving waiter never
/// misses a state change that happened before it started waiting.
pub struct BlockingGate {
    pending: Mutex<usize>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl BlockingGate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            pending: Mutex::new(0),
            tx,
            rx,
        }
    }

    /// Register a new outstanding blocking build, closing the gate.
    pub async fn begin(&self) {
        let mut pending = self.pending.lock().await;
        *pending += 1;
        let _ = self.tx.send(false);
    }

    /// Mark one outstanding blocking build complete; opens the gate once
    /// the count reaches zero.
    pub async fn end(&self) {
        let mut pending = self.pending.lock().await;
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            let _ = self.tx.send(true);
        }
    }

    /// Await the gate opening. Returns immediately if already open.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        *self.pending.lock().await == 0
    }
}

impl Default for BlockingGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildResult as BR;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_schedule_calls_for_same_key_build_once() {
        let scheduler = Arc::new(BuildScheduler::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let make_fut = |scheduler: Arc<BuildScheduler>, calls: Arc<AtomicUsize>| async move {
            scheduler
                .schedule("k".to_string(), None, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(BR::default())
                    }
                })
                .await
        };

        let a = make_fut(scheduler.clone(), calls.clone());
        let b = make_fut(scheduler.clone(), calls.clone());
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_some());
        assert!(rb.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_skips_rebuild_within_window() {
        let scheduler = BuildScheduler::new();
        let recent = Instant::now();
        let result = scheduler
            .schedule("k".to_string(), Some(recent), || async { Ok(BR::default()) })
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn build_key_uses_sentinel_vs_request_path() {
        assert_eq!(build_key("src.rs", ALL_KEY), "src.rs");
        assert_eq!(build_key("src.rs", "/api/x"), "src.rs\n/api/x");
    }

    #[tokio::test]
    async fn gate_blocks_until_all_pending_builds_complete() {
        let gate = Arc::new(BlockingGate::new());
        assert!(gate.is_open().await);

        gate.begin().await;
        gate.begin().await;
        assert!(!gate.is_open().await);

        let waiter_gate = gate.clone();
        let waiter = tokio::spawn(async move {
            waiter_gate.wait().await;
        });

        gate.end().await;
        assert!(!gate.is_open().await);
        gate.end().await;

        waiter.await.unwrap();
        assert!(gate.is_open().await);
    }
}

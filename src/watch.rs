//! The filesystem-event aggregator (§4.3): coalesces raw watch
//! notifications into 500 ms batches, nets them down to disjoint
//! changed/removed sets, and maps those sets to the build matches they
//! invalidate.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::file_index::{FileIndex, RefreshOutcome};
use crate::registry::{BuilderResolver, ReconcileOutcome, Registry, ALL_KEY};

/// The debounce window: the first event in an empty window arms this
/// timer; later events in the same window extend nothing (§4.3).
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawKind {
    Add,
    Change,
    Unlink,
}

#[derive(Clone, Debug)]
pub struct RawEvent {
    pub kind: RawKind,
    pub path: PathBuf,
}

/// A live filesystem watch, raw `notify` events funneled through an
/// unbounded channel. No polling, no platform-specific watcher — always
/// the OS-native `RecommendedWatcher` (SPEC_FULL.md §4.3).
pub struct FsWatch {
    _watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<RawEvent>,
}

impl FsWatch {
    #[tracing::instrument(level = "trace", skip_all, fields(root = %root.display()))]
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = classify(event.kind) else {
                    return;
                };
                for path in event.paths {
                    let _ = tx.send(RawEvent { kind, path });
                }
            }
            Err(err) => tracing::warn!(error = ?err, "error from filesystem watcher"),
        })
        .context("failed to build file system watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {} for file system changes", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            raw_rx,
        })
    }

    /// Wait for the next debounced batch: blocks for the first event, then
    /// collects everything else that arrives within the fixed 500 ms
    /// window. Returns `None` once the watcher's sender side is dropped.
    pub async fn next_batch(&mut self) -> Option<Vec<RawEvent>> {
        let first = self.raw_rx.recv().await?;
        let mut batch = vec![first];

        let deadline = sleep(DEBOUNCE_WINDOW);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                maybe = self.raw_rx.recv() => {
                    match maybe {
                        Some(event) => batch.push(event),
                        None => break,
                    }
                }
            }
        }
        Some(batch)
    }
}

fn classify(kind: EventKind) -> Option<RawKind> {
    match kind {
        EventKind::Create(_) => Some(RawKind::Add),
        EventKind::Modify(_) => Some(RawKind::Change),
        EventKind::Remove(_) => Some(RawKind::Unlink),
        _ => None,
    }
}

/// The net-effect changed/removed sets from one batch. Disjoint by
/// construction: adding a path to one side evicts it from the other.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NetChange {
    pub changed: HashSet<PathBuf>,
    pub removed: HashSet<PathBuf>,
}

impl NetChange {
    fn mark_changed(&mut self, path: PathBuf) {
        self.removed.remove(&path);
        self.changed.insert(path);
    }

    fn mark_removed(&mut self, path: PathBuf) {
        self.changed.remove(&path);
        self.removed.insert(path);
    }
}

/// One (match, build-result key) pair whose `watch` globs intersect this
/// batch's net change set, and which is eligible to rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebuildTarget {
    pub src: String,
    pub key: String,
}

/// §4.3 processing steps, run once per debounced batch.
pub struct BatchOutcome {
    pub net_change: NetChange,
    pub reconcile: ReconcileOutcome,
    pub rebuilds: Vec<RebuildTarget>,
}

/// Apply one debounced batch of raw events to `index`/`registry`, per the
/// five processing steps in §4.3.
pub async fn process_batch(
    batch: Vec<RawEvent>,
    root: &Path,
    index: &mut FileIndex,
    registry: &mut Registry,
    resolver: &dyn BuilderResolver,
    cfg: &crate::config::manifest::Configuration,
) -> Result<BatchOutcome> {
    // Step 1: drop events under any known distPath.
    let dist_paths: Vec<PathBuf> = registry.matches().flat_map(|m| m.dist_paths()).collect();
    let is_under_dist = |path: &Path| dist_paths.iter().any(|dist| path.starts_with(dist));

    // Step 2: refresh the index, building disjoint changed/removed sets.
    let mut net_change = NetChange::default();
    for event in batch {
        if is_under_dist(&event.path) {
            continue;
        }
        let rel = event.path.strip_prefix(root).unwrap_or(&event.path).to_path_buf();
        match event.kind {
            RawKind::Add | RawKind::Change => match index.refresh(rel.clone()) {
                RefreshOutcome::Changed(path) => net_change.mark_changed(path),
                RefreshOutcome::Removed(path) => net_change.mark_removed(path),
                RefreshOutcome::Ignored => {}
            },
            RawKind::Unlink => {
                if index.remove(&rel) {
                    net_change.mark_removed(rel);
                }
            }
        }
    }

    // Step 3: re-reconcile the build-match registry (entrypoints may have
    // appeared or disappeared).
    let expected = crate::registry::expected_bindings(cfg, index)?;
    let reconcile = registry.reconcile(expected, resolver)?;

    // Step 4 + 5: compute the deduplicated rebuild set.
    let mut rebuilds = Vec::new();
    for build_match in registry.matches() {
        for (key, result) in &build_match.build_results {
            let Some(globs) = &result.watch else {
                continue;
            };
            if !watch_globs_match(globs, &net_change)? {
                continue;
            }
            if key != ALL_KEY {
                let ctx = crate::builder::ShouldServeContext {
                    entrypoint: PathBuf::from(&build_match.src),
                    files: std::sync::Arc::new(index.snapshot()),
                    config: build_match.config.clone(),
                    request_path: key.clone(),
                    work_path: root.to_path_buf(),
                };
                if build_match.builder.should_serve(&ctx).await != Some(true) {
                    continue;
                }
            }
            rebuilds.push(RebuildTarget {
                src: build_match.src.clone(),
                key: key.clone(),
            });
        }
    }

    Ok(BatchOutcome {
        net_change,
        reconcile,
        rebuilds,
    })
}

fn watch_globs_match(globs: &[String], net_change: &NetChange) -> Result<bool> {
    let mut builder = GlobSetBuilder::new();
    for pattern in globs {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid watch glob {pattern:?}"))?);
    }
    let set = builder.build().context("error compiling watch globset")?;
    Ok(net_change
        .changed
        .iter()
        .chain(net_change.removed.iter())
        .any(|path| set.is_match(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_change_keeps_changed_and_removed_disjoint() {
        let mut net = NetChange::default();
        net.mark_changed(PathBuf::from("a.txt"));
        net.mark_removed(PathBuf::from("a.txt"));
        assert!(!net.changed.contains(Path::new("a.txt")));
        assert!(net.removed.contains(Path::new("a.txt")));

        net.mark_changed(PathBuf::from("a.txt"));
        assert!(net.changed.contains(Path::new("a.txt")));
        assert!(!net.removed.contains(Path::new("a.txt")));
    }

    #[test]
    fn watch_globs_match_checks_both_changed_and_removed() {
        let mut net = NetChange::default();
        net.mark_removed(PathBuf::from("src/lib.rs"));
        assert!(watch_globs_match(&["src/**/*.rs".to_string()], &net).unwrap());
        assert!(!watch_globs_match(&["src/**/*.css".to_string()], &net).unwrap());
    }

    #[tokio::test]
    async fn batch_collects_events_within_debounce_window() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watch = FsWatch::new(tmp.path()).unwrap();

        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "1").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), watch.next_batch())
            .await
            .expect("batch should arrive")
            .expect("channel should be open");
        assert!(!batch.is_empty());
    }
}

//! The build-match registry (§4.2): reconciles the builder bindings a
//! config+file-list pair expect to exist against the bindings currently
//! live, and holds each binding's accumulated build outputs.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use globset::Glob;

use crate::builder::{Asset, BuildResult, Builder};
use crate::config::manifest::Configuration;
use crate::file_index::FileIndex;

/// The identity `use` for the implicit static-file builder, exempt from
/// the builder-package update purge (§4.5).
pub const STATIC_BUILDER_ID: &str = "static";

/// The sentinel build-result key for builders that don't key their output
/// by request path.
pub const ALL_KEY: &str = "all";

/// One binding the registry expects to exist, derived from config + files.
#[derive(Clone, Debug)]
pub struct ExpectedBinding {
    pub src: String,
    pub use_id: String,
    pub config: serde_json::Value,
}

/// Resolves a `use` identifier to a live builder instance. Package
/// installation/module loading is out of scope (§1); this is the seam the
/// core calls into.
pub trait BuilderResolver {
    fn resolve(&self, use_id: &str) -> Option<Arc<dyn Builder>>;
}

/// Expand a manifest into its expected bindings against the current file
/// list. Explicit `builds` entries bind one entrypoint per matching file;
/// an empty `builds` list means zero-config autodetection — everything is
/// served by the static builder.
pub fn expected_bindings(cfg: &Configuration, index: &FileIndex) -> Result<Vec<ExpectedBinding>> {
    if cfg.builds.is_empty() {
        return Ok(vec![ExpectedBinding {
            src: "**/*".to_string(),
            use_id: STATIC_BUILDER_ID.to_string(),
            config: serde_json::Value::Null,
        }]);
    }

    let mut bindings = Vec::new();
    for entry in &cfg.builds {
        let glob = Glob::new(&entry.src)
            .with_context(|| format!("invalid build entrypoint glob {:?}", entry.src))?
            .compile_matcher();
        let mut matched_any = false;
        for file in index.iter() {
            if glob.is_match(&file.rel_path) {
                matched_any = true;
                bindings.push(ExpectedBinding {
                    src: file.rel_path.to_string_lossy().into_owned(),
                    use_id: entry.use_id.clone(),
                    config: entry.config.clone(),
                });
            }
        }
        if !matched_any && !has_glob_meta(&entry.src) {
            // A literal path with no matching file still yields a binding;
            // the builder may be responsible for generating it (e.g. a
            // function with no static counterpart).
            bindings.push(ExpectedBinding {
                src: entry.src.clone(),
                use_id: entry.use_id.clone(),
                config: entry.config.clone(),
            });
        }
    }
    Ok(bindings)
}

pub(crate) fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// A live binding plus its accumulated build outputs.
#[derive(Clone)]
pub struct BuildMatch {
    pub src: String,
    pub use_id: String,
    pub config: serde_json::Value,
    pub builder: Arc<dyn Builder>,
    pub build_timestamp: Option<Instant>,
    pub build_results: HashMap<String, BuildResult>,
}

impl BuildMatch {
    fn new(binding: ExpectedBinding, builder: Arc<dyn Builder>) -> Self {
        Self {
            src: binding.src,
            use_id: binding.use_id,
            config: binding.config,
            builder,
            build_timestamp: None,
            build_results: HashMap::new(),
        }
    }

    /// Whether this match's builder needs a blocking initial build because
    /// it cannot decide servability lazily.
    pub fn needs_blocking_build(&self) -> bool {
        !self.builder.supports_should_serve()
    }

    /// The union of all build-result outputs, keyed by asset path, per §3.
    pub fn build_output(&self) -> HashMap<String, Asset> {
        let mut out = HashMap::new();
        for result in self.build_results.values() {
            for (path, asset) in &result.output {
                out.insert(path.clone(), asset.clone());
            }
        }
        out
    }

    /// `distPath`s declared across this match's build results, used by the
    /// FS aggregator to filter out build-output churn (§4.3 step 1).
    pub fn dist_paths(&self) -> Vec<PathBuf> {
        self.build_results
            .values()
            .filter_map(|result| result.dist_path.clone())
            .collect()
    }

    fn is_static_catch_all(&self) -> bool {
        self.use_id == STATIC_BUILDER_ID
    }
}

/// The outcome of a reconciliation pass.
#[derive(Default)]
pub struct ReconcileOutcome {
    /// Entrypoints of newly created matches whose builder needs a blocking
    /// initial build (§4.2).
    pub pending_blocking_builds: Vec<String>,
    /// Builders whose bindings were removed; caller must await `shutdown`
    /// on each before dropping them.
    pub shutdown: Vec<Arc<dyn Builder>>,
}

/// The set of live build matches, keyed by entrypoint (`src`).
#[derive(Default)]
pub struct Registry {
    matches: Vec<BuildMatch>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, src: &str) -> Option<&BuildMatch> {
        self.matches.iter().find(|m| m.src == src)
    }

    pub fn get_mut(&mut self, src: &str) -> Option<&mut BuildMatch> {
        self.matches.iter_mut().find(|m| m.src == src)
    }

    /// Find the match that best owns `asset_path`: an exact output match
    /// first, falling back to a prefix match against `src` for directory
    /// listings (§4.7 step 9, §9 open question: listings reflect the
    /// registry, not the raw file index).
    pub fn matches(&self) -> impl Iterator<Item = &BuildMatch> {
        self.matches.iter()
    }

    /// Reconcile the live set against `expected`, per §4.2: add missing or
    /// rebound entrypoints, remove stale ones, then sort so any
    /// static-catch-all binding sorts last.
    pub fn reconcile(
        &mut self,
        expected: Vec<ExpectedBinding>,
        resolver: &dyn BuilderResolver,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let expected_by_src: HashMap<&str, &ExpectedBinding> =
            expected.iter().map(|b| (b.src.as_str(), b)).collect();

        let mut kept = Vec::with_capacity(self.matches.len());
        for existing in self.matches.drain(..) {
            match expected_by_src.get(existing.src.as_str()) {
                Some(binding) if binding.use_id == existing.use_id => kept.push(existing),
                Some(_) => outcome.shutdown.push(existing.builder.clone()),
                None => outcome.shutdown.push(existing.builder.clone()),
            }
        }
        self.matches = kept;

        for binding in expected {
            if self.get(&binding.src).is_some() {
                continue;
            }
            let Some(builder) = resolver.resolve(&binding.use_id) else {
                anyhow::bail!("no builder registered for use id {:?}", binding.use_id);
            };
            let needs_blocking = !builder.supports_should_serve();
            let src = binding.src.clone();
            self.matches.push(BuildMatch::new(binding, builder));
            if needs_blocking {
                outcome.pending_blocking_builds.push(src);
            }
        }

        self.matches
            .sort_by_key(|m| (m.is_static_catch_all(), m.src.clone()));

        Ok(outcome)
    }

    /// The builder-package update path (§4.5): purge every match whose
    /// `use` is in `updated`, except the identity static builder.
    pub fn purge_updated(&mut self, updated: &HashSet<String>) -> Vec<Arc<dyn Builder>> {
        let mut purged = Vec::new();
        self.matches.retain(|m| {
            if m.use_id != STATIC_BUILDER_ID && updated.contains(&m.use_id) {
                purged.push(m.builder.clone());
                false
            } else {
                true
            }
        });
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildContext, BuildResult as BR, ShouldServeContext};
    use async_trait::async_trait;

    struct StubBuilder {
        lazy: bool,
    }

    #[async_trait]
    impl Builder for StubBuilder {
        async fn build(&self, _ctx: &BuildContext) -> Result<BR> {
            Ok(BR::default())
        }
        fn supports_should_serve(&self) -> bool {
            self.lazy
        }
        async fn should_serve(&self, _ctx: &ShouldServeContext) -> Option<bool> {
            if self.lazy {
                Some(true)
            } else {
                None
            }
        }
    }

    struct FixedResolver(HashMap<String, Arc<dyn Builder>>);
    impl BuilderResolver for FixedResolver {
        fn resolve(&self, use_id: &str) -> Option<Arc<dyn Builder>> {
            self.0.get(use_id).cloned()
        }
    }

    fn resolver() -> FixedResolver {
        let mut map: HashMap<String, Arc<dyn Builder>> = HashMap::new();
        map.insert(STATIC_BUILDER_ID.to_string(), Arc::new(StubBuilder { lazy: false }));
        map.insert("eager-fn".to_string(), Arc::new(StubBuilder { lazy: false }));
        map.insert("lazy-fn".to_string(), Arc::new(StubBuilder { lazy: true }));
        FixedResolver(map)
    }

    #[test]
    fn new_eager_binding_requires_blocking_build() {
        let mut registry = Registry::new();
        let resolver = resolver();
        let expected = vec![ExpectedBinding {
            src: "api/hello.js".to_string(),
            use_id: "eager-fn".to_string(),
            config: serde_json::Value::Null,
        }];
        let outcome = registry.reconcile(expected, &resolver).unwrap();
        assert_eq!(outcome.pending_blocking_builds, vec!["api/hello.js".to_string()]);
        assert!(registry.get("api/hello.js").unwrap().needs_blocking_build());
    }

    #[test]
    fn lazy_binding_does_not_need_blocking_build() {
        let mut registry = Registry::new();
        let resolver = resolver();
        let expected = vec![ExpectedBinding {
            src: "api/lazy.js".to_string(),
            use_id: "lazy-fn".to_string(),
            config: serde_json::Value::Null,
        }];
        let outcome = registry.reconcile(expected, &resolver).unwrap();
        assert!(outcome.pending_blocking_builds.is_empty());
    }

    #[test]
    fn static_catch_all_sorts_last() {
        let mut registry = Registry::new();
        let resolver = resolver();
        let expected = vec![
            ExpectedBinding {
                src: "**/*".to_string(),
                use_id: STATIC_BUILDER_ID.to_string(),
                config: serde_json::Value::Null,
            },
            ExpectedBinding {
                src: "api/hello.js".to_string(),
                use_id: "eager-fn".to_string(),
                config: serde_json::Value::Null,
            },
        ];
        registry.reconcile(expected, &resolver).unwrap();
        let last = registry.matches().last().unwrap();
        assert_eq!(last.use_id, STATIC_BUILDER_ID);
    }

    #[test]
    fn removed_binding_is_queued_for_shutdown() {
        let mut registry = Registry::new();
        let resolver = resolver();
        let initial = vec![ExpectedBinding {
            src: "api/hello.js".to_string(),
            use_id: "eager-fn".to_string(),
            config: serde_json::Value::Null,
        }];
        registry.reconcile(initial, &resolver).unwrap();

        let outcome = registry.reconcile(vec![], &resolver).unwrap();
        assert_eq!(outcome.shutdown.len(), 1);
        assert!(registry.get("api/hello.js").is_none());
    }

    #[test]
    fn purge_updated_skips_static_identity_builder() {
        let mut registry = Registry::new();
        let resolver = resolver();
        let expected = vec![
            ExpectedBinding {
                src: "**/*".to_string(),
                use_id: STATIC_BUILDER_ID.to_string(),
                config: serde_json::Value::Null,
            },
            ExpectedBinding {
                src: "api/hello.js".to_string(),
                use_id: "eager-fn".to_string(),
                config: serde_json::Value::Null,
            },
        ];
        registry.reconcile(expected, &resolver).unwrap();

        let mut updated = HashSet::new();
        updated.insert(STATIC_BUILDER_ID.to_string());
        updated.insert("eager-fn".to_string());
        let purged = registry.purge_updated(&updated);

        assert_eq!(purged.len(), 1);
        assert!(registry.get("**/*").is_some());
        assert!(registry.get("api/hello.js").is_none());
    }
}

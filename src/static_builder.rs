//! The implicit static-file builder (§4.2, §6): identity `"static"`, the
//! builder a zero-config project (no `builds` entries) is bound to. It
//! turns the current file snapshot into `FileFsRef` assets, aliasing
//! `index.html` onto its directory's path so directory-index requests
//! resolve the way the platform's real static builder does.

use std::path::Path;
use std::sync::Arc;
use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::builder::{Asset, BuildContext, BuildResult, Builder, ShouldServeContext};
use crate::registry::{BuilderResolver, STATIC_BUILDER_ID};

/// The identity static-file builder. Exempt from the builder-package
/// update purge (§4.5) by its `use` id alone, enforced in `registry`.
#[derive(Default)]
pub struct StaticBuilder;

#[async_trait]
impl Builder for StaticBuilder {
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(files = ctx.files.len()))]
    async fn build(&self, ctx: &BuildContext) -> Result<BuildResult> {
        let mut output = HashMap::new();
        for file in ctx.files.values() {
            let asset_path = to_asset_path(&file.rel_path);
            let asset = Asset::FileFsRef {
                fs_path: file.fs_path.clone(),
                mode: file.mode,
            };
            for alias in index_aliases(&file.rel_path, &asset_path) {
                output.insert(alias, asset.clone());
            }
            output.insert(asset_path, asset);
        }
        Ok(BuildResult {
            output,
            routes: None,
            watch: Some(vec!["**/*".to_string()]),
            dist_path: None,
        })
    }

    /// Static assets can always be decided lazily: existence on disk is the
    /// whole answer, so no blocking initial build is required (§4.2).
    fn supports_should_serve(&self) -> bool {
        true
    }

    async fn should_serve(&self, ctx: &ShouldServeContext) -> Option<bool> {
        let exists = ctx.files.values().any(|f| {
            let asset_path = to_asset_path(&f.rel_path);
            asset_path == ctx.request_path || index_aliases(&f.rel_path, &asset_path).contains(&ctx.request_path)
        });
        Some(exists)
    }
}

fn to_asset_path(rel_path: &Path) -> String {
    let mut posix = rel_path
        .iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if !posix.starts_with('/') {
        posix.insert(0, '/');
    }
    posix
}

/// For `dir/index.html`, also serve `/dir` and `/dir/`. For a root
/// `index.html`, also serve `/`.
fn index_aliases(rel_path: &Path, asset_path: &str) -> Vec<String> {
    if rel_path.file_name().and_then(|n| n.to_str()) != Some("index.html") {
        return Vec::new();
    }
    match asset_path.strip_suffix("/index.html") {
        Some("") => vec!["/".to_string()],
        Some(dir) => vec![dir.to_string(), format!("{dir}/")],
        None => Vec::new(),
    }
}

/// Resolves `"static"` to the implicit builder above; every other `use` id
/// is unresolvable, since package installation and plugin loading are out
/// of scope (§1) for this core. A richer embedder would compose its own
/// `BuilderResolver` with this one as a fallback.
pub struct StaticResolver {
    static_builder: Arc<dyn Builder>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self {
            static_builder: Arc::new(StaticBuilder),
        }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BuilderResolver for StaticResolver {
    fn resolve(&self, use_id: &str) -> Option<Arc<dyn Builder>> {
        if use_id == STATIC_BUILDER_ID {
            Some(self.static_builder.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    use crate::file_index::FileDescriptor;

    fn descriptor(rel: &str) -> FileDescriptor {
        FileDescriptor {
            rel_path: PathBuf::from(rel),
            mode: 0o644,
            fs_path: PathBuf::from("/project").join(rel),
        }
    }

    #[tokio::test]
    async fn build_aliases_root_index_html_to_slash() {
        let mut files = Map::new();
        files.insert(PathBuf::from("index.html"), descriptor("index.html"));

        let ctx = BuildContext {
            files: Arc::new(files),
            entrypoint: PathBuf::from("**/*"),
            config: serde_json::Value::Null,
            work_path: PathBuf::from("/project"),
            env: Map::new(),
            build_env: Map::new(),
            request_path: None,
        };

        let result = StaticBuilder.build(&ctx).await.unwrap();
        assert!(result.output.contains_key("/"));
        assert!(result.output.contains_key("/index.html"));
    }

    #[tokio::test]
    async fn build_aliases_nested_index_html_to_directory() {
        let mut files = Map::new();
        files.insert(PathBuf::from("docs/index.html"), descriptor("docs/index.html"));

        let ctx = BuildContext {
            files: Arc::new(files),
            entrypoint: PathBuf::from("**/*"),
            config: serde_json::Value::Null,
            work_path: PathBuf::from("/project"),
            env: Map::new(),
            build_env: Map::new(),
            request_path: None,
        };

        let result = StaticBuilder.build(&ctx).await.unwrap();
        assert!(result.output.contains_key("/docs"));
        assert!(result.output.contains_key("/docs/"));
        assert!(result.output.contains_key("/docs/index.html"));
    }

    #[test]
    fn static_resolver_only_resolves_the_static_id() {
        let resolver = StaticResolver::new();
        assert!(resolver.resolve(STATIC_BUILDER_ID).is_some());
        assert!(resolver.resolve("@now/node").is_none());
    }
}

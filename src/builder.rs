//! The builder interface (§6). Builders are opaque to the core: this module
//! defines only the capability set the core is allowed to call
//! (`build`, `should_serve`, `shutdown`) and the shapes that cross that
//! boundary (`BuildResult`, `Asset`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::file_index::FileDescriptor;
use crate::lambda::LambdaFn;
use crate::router::RouteRule;

/// Everything a builder needs to produce a [`BuildResult`].
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub files: Arc<HashMap<PathBuf, FileDescriptor>>,
    pub entrypoint: PathBuf,
    pub config: serde_json::Value,
    pub work_path: PathBuf,
    pub env: HashMap<String, String>,
    pub build_env: HashMap<String, String>,
    /// `Some(path)` when this build is for one specific request-path key
    /// rather than the "all" sentinel.
    pub request_path: Option<String>,
}

/// Everything a builder needs to answer "should I serve this request
/// lazily, or was I already eagerly built?".
#[derive(Clone, Debug)]
pub struct ShouldServeContext {
    pub entrypoint: PathBuf,
    pub files: Arc<HashMap<PathBuf, FileDescriptor>>,
    pub config: serde_json::Value,
    pub request_path: String,
    pub work_path: PathBuf,
}

/// A concrete servable unit produced by a build.
#[derive(Clone)]
pub enum Asset {
    FileFsRef { fs_path: PathBuf, mode: u32 },
    FileBlob { data: Bytes, content_type: Option<String> },
    Lambda { handler: Arc<dyn LambdaFn>, handler_meta: serde_json::Value },
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Asset::FileFsRef { fs_path, mode } => f
                .debug_struct("FileFsRef")
                .field("fs_path", fs_path)
                .field("mode", mode)
                .finish(),
            Asset::FileBlob { data, content_type } => f
                .debug_struct("FileBlob")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
            Asset::Lambda { handler_meta, .. } => f
                .debug_struct("Lambda")
                .field("handler_meta", handler_meta)
                .finish(),
        }
    }
}

/// One invocation's outputs: assets, any sub-routes, and the watch/distPath
/// declarations the FS aggregator needs.
#[derive(Clone, Debug, Default)]
pub struct BuildResult {
    pub output: HashMap<String, Asset>,
    pub routes: Option<Vec<RouteRule>>,
    pub watch: Option<Vec<String>>,
    pub dist_path: Option<PathBuf>,
}

/// The capability set a builder exposes. Identity is the `use` string the
/// binding is registered under (see `crate::registry`).
#[async_trait]
pub trait Builder: Send + Sync {
    /// Produce (or re-produce) this entrypoint's outputs.
    async fn build(&self, ctx: &BuildContext) -> Result<BuildResult>;

    /// Builders that can decide lazily whether they can serve a given
    /// request path implement this; builders that must produce everything
    /// up front (and therefore need a blocking initial build, §4.2) leave
    /// it at the default `None`.
    async fn should_serve(&self, _ctx: &ShouldServeContext) -> Option<bool> {
        None
    }

    /// Declares whether this builder implements lazy servability at all.
    /// The registry uses this (not a live `should_serve` call, which needs
    /// a request path that doesn't exist yet at reconciliation time) to
    /// decide whether a new binding needs a blocking initial build.
    fn supports_should_serve(&self) -> bool {
        false
    }

    /// Release any resources before this binding is dropped.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EagerBuilder;

    #[async_trait]
    impl Builder for EagerBuilder {
        async fn build(&self, _ctx: &BuildContext) -> Result<BuildResult> {
            Ok(BuildResult::default())
        }
    }

    #[tokio::test]
    async fn default_should_serve_is_none_meaning_blocking() {
        let builder = EagerBuilder;
        let ctx = ShouldServeContext {
            entrypoint: PathBuf::from("index.html"),
            files: Arc::new(HashMap::new()),
            config: serde_json::Value::Null,
            request_path: "/".to_string(),
            work_path: PathBuf::from("/tmp"),
        };
        assert_eq!(builder.should_serve(&ctx).await, None);
    }
}

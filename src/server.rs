//! The server object (§3 "Ownership & lifecycle"): owns the file index,
//! build-match registry, scheduler, and everything the dispatcher and the
//! FS aggregator mutate. A single `Mutex` serializes index/registry
//! mutation, matching the single-threaded cooperative-concurrency model
//! of §5 — builders, proxy I/O, and file stats are the only suspension
//! points; the lock is never held across one of those awaits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::manifest::Configuration;
use crate::file_index::FileIndex;
use crate::proxy::ProxyClients;
use crate::registry::{BuilderResolver, Registry};
use crate::router::RouteRule;
use crate::scheduler::BuildScheduler;

/// The mutable core: file index, registry, and the manifest currently in
/// effect (replaced only by a config reload, which this server does not
/// perform mid-lifetime — see SPEC_FULL.md §4.9).
pub struct ServerCore {
    pub index: FileIndex,
    pub registry: Registry,
}

/// Everything the dispatcher and the watch loop share.
pub struct ServerState {
    pub root: PathBuf,
    pub manifest: Arc<Configuration>,
    pub core: tokio::sync::Mutex<ServerCore>,
    pub scheduler: BuildScheduler,
    pub resolver: Arc<dyn BuilderResolver>,
    pub proxy_clients: ProxyClients,
    pub routes: Vec<RouteRule>,
    pub env: HashMap<String, String>,
    pub build_env: HashMap<String, String>,
    pub stopping: AtomicBool,
}

impl ServerState {
    pub fn new(
        root: PathBuf,
        manifest: Arc<Configuration>,
        index: FileIndex,
        resolver: Arc<dyn BuilderResolver>,
        env: HashMap<String, String>,
        build_env: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let routes = manifest
            .routes
            .iter()
            .map(RouteRule::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            root,
            manifest,
            core: tokio::sync::Mutex::new(ServerCore {
                index,
                registry: Registry::new(),
            }),
            scheduler: BuildScheduler::new(),
            resolver,
            proxy_clients: ProxyClients::new(),
            routes,
            env,
            build_env,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

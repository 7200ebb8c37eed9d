//! The lifecycle controller (§4.9): `start`/`stop` for the whole server
//! process. `start` loads the file index, reconciles the initial build
//! matches and runs their blocking builds sequentially, brings up the FS
//! watcher and the builder-package update seam (§4.5), then binds the HTTP
//! listener — retrying on collision for a numeric port, failing fatally for
//! a named socket. `stop` is idempotent and tears everything back down.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::dispatcher;
use crate::file_index::FileIndex;
use crate::registry::{self, BuilderResolver, ALL_KEY};
use crate::config::rt::RtcServe;
use crate::server::ServerState;
use crate::static_builder::StaticResolver;
use crate::watch::{self, FsWatch, RawEvent};

/// Where to bind the HTTP listener (§4.9 step 7, §6 "Port selection").
#[derive(Clone, Debug)]
pub enum ListenSpec {
    /// A numeric port; incremented on `EADDRINUSE` until a free one binds.
    Port(u16),
    /// A named Unix domain socket; failures here are fatal, never retried.
    Unix(PathBuf),
}

/// Ignore patterns applied to the initial scan and to every FS event,
/// absent a richer `.gitignore`-semantics parser (SPEC_FULL.md §4.1).
const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    ".git/**",
    "node_modules",
    "node_modules/**",
    ".devdeploy",
    ".devdeploy/**",
];

/// A running server instance and the background tasks `stop` must tear
/// down.
pub struct Running {
    pub state: Arc<ServerState>,
    pub local_addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    watch_task: JoinHandle<()>,
    update_task: JoinHandle<()>,
    server_task: JoinHandle<Result<()>>,
    update_tx: mpsc::UnboundedSender<Vec<String>>,
}

impl Running {
    /// The sender side of the builder-package update seam (§4.5). Nothing
    /// in this core produces updates on it — package installation is out
    /// of scope (§1) — but an embedder driving its own loader cache can
    /// feed updated `use` identifiers here.
    pub fn builder_update_sender(&self) -> mpsc::UnboundedSender<Vec<String>> {
        self.update_tx.clone()
    }

    /// §4.9 `stop`: idempotent via the `stopping` flag, shuts down every
    /// live builder, closes the HTTP listener and the watcher, and awaits
    /// the background update task.
    pub async fn stop(self) -> Result<()> {
        if self.state.is_stopping() {
            return Ok(());
        }
        self.state.mark_stopping();

        {
            let core = self.state.core.lock().await;
            for build_match in core.registry.matches() {
                build_match.builder.shutdown().await;
            }
        }

        let _ = self.shutdown_tx.send(());
        drop(self.update_tx);
        self.watch_task.abort();

        if let Err(err) = self.update_task.await {
            if !err.is_cancelled() {
                tracing::warn!(error = %err, "update task ended unexpectedly");
            }
        }

        match self.server_task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if is_not_running(&err) {
                    tracing::debug!(error = %err, "server was already stopped");
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(err).context("error awaiting HTTP server task"),
        }
    }
}

fn is_not_running(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.to_string().contains("not running"))
}

/// §4.9 `start`.
#[tracing::instrument(level = "debug", skip(cfg), fields(root = %cfg.project_root.display()))]
pub async fn start(cfg: RtcServe, listen: ListenSpec) -> Result<Running> {
    let root = cfg.project_root.clone();
    anyhow::ensure!(
        root.is_dir(),
        "project root {} does not exist or is not a directory",
        root.display()
    );

    let ignore_patterns: Vec<String> = DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect();
    let ignore = FileIndex::build_ignore(&ignore_patterns)?;
    let index = FileIndex::scan(&root, ignore)?;

    // §6: the build env is also copied into the process environment, since
    // builders may be subprocesses that inherit it rather than read
    // `BuildContext.build_env` directly. Must happen before any build runs.
    for (key, value) in &cfg.build_env {
        std::env::set_var(key, value);
    }

    let resolver: Arc<dyn BuilderResolver> = Arc::new(StaticResolver::new());
    let state = Arc::new(ServerState::new(
        root.clone(),
        cfg.manifest.clone(),
        index,
        resolver.clone(),
        cfg.env.clone(),
        cfg.build_env.clone(),
    )?);

    let pending = {
        let mut core = state.core.lock().await;
        let expected = registry::expected_bindings(&state.manifest, &core.index)?;
        core.registry.reconcile(expected, resolver.as_ref())?.pending_blocking_builds
    };
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "Creating initial build(s)");
    }
    for src in pending {
        run_blocking_build(&state, &src).await;
    }

    let (update_tx, update_rx) = mpsc::unbounded_channel::<Vec<String>>();
    let update_task = spawn_update_task(state.clone(), resolver.clone(), update_rx);

    let watch = FsWatch::new(&root).context("failed to start file system watcher")?;
    tracing::info!(root = %root.display(), "watching for file system changes");
    let watch_task = spawn_watch_task(state.clone(), resolver.clone(), watch);

    let (shutdown_tx, _) = broadcast::channel(1);
    let app = Router::new()
        .fallback(dispatcher::handle)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state.clone());
    let (server_task, local_addr) = bind_and_serve(listen, app, shutdown_tx.subscribe())?;

    Ok(Running {
        state,
        local_addr,
        shutdown_tx,
        watch_task,
        update_task,
        server_task,
        update_tx,
    })
}

/// Run one blocking initial (or re-triggered) build under the gate (§4.4
/// "Blocking-build gate"), so in-flight requests wait for it.
async fn run_blocking_build(state: &Arc<ServerState>, src: &str) {
    state.scheduler.gate.begin().await;
    dispatcher::trigger_build(state, src, ALL_KEY, src).await;
    state.scheduler.gate.end().await;
}

fn spawn_update_task(
    state: Arc<ServerState>,
    resolver: Arc<dyn BuilderResolver>,
    mut update_rx: mpsc::UnboundedReceiver<Vec<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(updated_ids) = update_rx.recv().await {
            apply_builder_update(&state, resolver.as_ref(), updated_ids).await;
        }
    })
}

/// The builder-package update path (§4.5): purge matches bound to any
/// updated `use` id (except the static identity builder), shut down their
/// builders, then re-reconcile so fresh bindings take their place.
async fn apply_builder_update(state: &Arc<ServerState>, resolver: &dyn BuilderResolver, updated_ids: Vec<String>) {
    let updated: HashSet<String> = updated_ids.into_iter().collect();

    let (purged, pending) = {
        let mut core = state.core.lock().await;
        let purged = core.registry.purge_updated(&updated);
        let expected = match registry::expected_bindings(&state.manifest, &core.index) {
            Ok(expected) => expected,
            Err(err) => {
                tracing::error!(error = %err, "error computing expected bindings during builder update");
                return;
            }
        };
        let outcome = match core.registry.reconcile(expected, resolver) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "error reconciling registry during builder update");
                return;
            }
        };
        (purged, outcome.pending_blocking_builds)
    };

    for builder in purged {
        builder.shutdown().await;
    }
    for src in pending {
        run_blocking_build(state, &src).await;
    }
}

fn spawn_watch_task(state: Arc<ServerState>, resolver: Arc<dyn BuilderResolver>, mut watch: FsWatch) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = watch.next_batch().await {
            if state.is_stopping() {
                break;
            }
            if let Err(err) = process_one_batch(&state, resolver.as_ref(), batch).await {
                tracing::error!(error = %err, "error processing file system batch");
            }
        }
    })
}

/// Apply one debounced FS batch (§4.3) and react to its outcome: shut down
/// builders whose bindings were removed, run newly required blocking
/// builds, and trigger every deduplicated rebuild.
async fn process_one_batch(state: &Arc<ServerState>, resolver: &dyn BuilderResolver, batch: Vec<RawEvent>) -> Result<()> {
    let (pending, rebuilds, shutdowns) = {
        let mut core = state.core.lock().await;
        let root = state.root.clone();
        let manifest = state.manifest.clone();
        let outcome =
            watch::process_batch(batch, &root, &mut core.index, &mut core.registry, resolver, &manifest).await?;
        (outcome.reconcile.pending_blocking_builds, outcome.rebuilds, outcome.reconcile.shutdown)
    };

    for builder in shutdowns {
        builder.shutdown().await;
    }

    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "new entrypoint(s) detected, running blocking build(s)");
    }
    for src in pending {
        run_blocking_build(state, &src).await;
    }

    for target in rebuilds {
        dispatcher::trigger_build(state, &target.src, &target.key, &target.key).await;
    }

    Ok(())
}

/// Bind the listener per `listen` and spawn the HTTP server task. Numeric
/// ports retry on `EADDRINUSE` (§4.9 step 7, §6, §8 "Port retry"); named
/// sockets fail fatally.
fn bind_and_serve(
    listen: ListenSpec,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(JoinHandle<Result<()>>, Option<SocketAddr>)> {
    match listen {
        ListenSpec::Port(port) => {
            let (listener, bound_port) = bind_with_retry(port)?;
            let local_addr = listener.local_addr().ok();
            tracing::info!(port = bound_port, "server listening");

            let handle = Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                let _ = shutdown_rx.recv().await;
                tracing::debug!("server is shutting down");
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(0)));
            });

            let task = tokio::spawn(async move {
                axum_server::from_tcp(listener)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .context("error running HTTP server")
            });
            Ok((task, local_addr))
        }
        ListenSpec::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("error removing stale socket {}", path.display()))?;
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("error binding unix socket {}", path.display()))?;
            tracing::info!(path = %path.display(), "server listening on unix socket");

            let task = tokio::spawn(async move {
                axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                        tracing::debug!("server is shutting down");
                    })
                    .await
                    .context("error running HTTP server")
            });
            Ok((task, None))
        }
    }
}

/// Bind a numeric port, incrementing on collision until one succeeds (§4.9
/// step 7). Non-`EADDRINUSE` errors are fatal.
fn bind_with_retry(port: u16) -> Result<(StdTcpListener, u16)> {
    let mut candidate = port;
    loop {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), candidate);
        match StdTcpListener::bind(addr) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .context("error setting listener non-blocking")?;
                return Ok((listener, candidate));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(port = candidate, "port in use, retrying on next port");
                candidate = candidate
                    .checked_add(1)
                    .context("exhausted ports while retrying bind")?;
            }
            Err(err) => return Err(err).with_context(|| format!("error binding to port {candidate}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_with_retry_finds_next_free_port() {
        let blocker = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken_port = blocker.local_addr().unwrap().port();

        let (listener, bound_port) = bind_with_retry(taken_port).unwrap();
        assert_ne!(bound_port, taken_port);
        assert_eq!(listener.local_addr().unwrap().port(), bound_port);
    }

    #[test]
    fn is_not_running_detects_the_race_message() {
        let err = anyhow::anyhow!("server is not running");
        assert!(is_not_running(&err));
        let err = anyhow::anyhow!("some other failure");
        assert!(!is_not_running(&err));
    }
}

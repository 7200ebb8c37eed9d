//! The request dispatcher (§4.7): the axum handler wiring for every
//! incoming request, including recursive sub-route descent, asset-variant
//! dispatch, and directory-listing fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::builder::{Asset, BuildContext, BuildResult};
use crate::registry::{Registry, ALL_KEY};
use crate::request_id;
use crate::response::{self, ErrorKind};
use crate::router::{self, RouteRule};
use crate::scheduler::build_key;
use crate::server::ServerState;

/// Recursive descent is capped at one level (§4.7 step 7, §8).
const MAX_CALL_LEVEL: u8 = 1;

pub async fn handle(State(state): State<Arc<ServerState>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let request_id = request_id::generate();
            tracing::warn!(error = %err, "error reading request body");
            return response::render_error(None, ErrorKind::Internal, "error reading request body", &request_id);
        }
    };

    let routes = state.routes.clone();
    dispatch(&state, parts.method, parts.uri, parts.headers, body, &routes, 0).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &Arc<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    routes: &[RouteRule],
    call_level: u8,
) -> Response {
    let request_id = request_id::generate();
    let accept = headers.get("accept").and_then(|v| v.to_str().ok());

    if state.is_stopping() {
        return response::render_error(accept, ErrorKind::NotFound, "server is stopping", &request_id);
    }

    // Step 3: URL normalization. Collapse `//+` to `/`.
    let original_path = uri.path().to_string();
    let normalized_path = normalize_slashes(&original_path);
    let path = if normalized_path != original_path {
        if method == Method::GET && call_level == 0 {
            let mut location = normalized_path.clone();
            if let Some(query) = uri.query() {
                location.push('?');
                location.push_str(query);
            }
            return response::render_redirect(StatusCode::MOVED_PERMANENTLY, &location, accept, &request_id);
        }
        normalized_path
    } else {
        original_path
    };

    // Step 4: refresh the build-match registry, then await the
    // blocking-build gate before routing.
    if call_level == 0 {
        refresh_registry(state).await;
        state.scheduler.gate.wait().await;
    }

    let route_result = {
        let core = state.core.lock().await;
        let probe = RegistryProbeBound(&core.registry);
        router::evaluate(routes, &path, method.as_str(), &probe)
    };

    if let Some(dest) = &route_result.dest {
        if is_absolute_url(dest) {
            return proxy_request(state, &method, dest, &headers, body, &request_id).await;
        }
    }

    if let Some(status) = route_result.status {
        if matches!(status, 301 | 302 | 303) {
            let location = route_result.dest.clone().unwrap_or_else(|| path.clone());
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND);
            let mut response = response::render_redirect(status, &location, accept, &request_id);
            for (key, value) in &route_result.headers {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(key.as_bytes()),
                    axum::http::HeaderValue::from_str(value),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            return response;
        }
    }

    let effective_path = route_result.dest.clone().unwrap_or(path);
    let no_cache = has_no_cache(&headers);

    // Step 6: resolve (and if needed, (re)build) the target build match.
    let resolved = resolve_or_build(state, &effective_path, no_cache).await;
    let Some((_src, build_result)) = resolved else {
        return directory_listing_or_404(state, &effective_path, accept, &request_id).await;
    };

    // Step 7: recursive sub-route descent, capped at depth 1.
    if call_level < MAX_CALL_LEVEL {
        if let Some(sub_routes) = &build_result.routes {
            return Box::pin(dispatch(
                state,
                method,
                format!("{effective_path}").parse().unwrap_or(uri),
                headers,
                body,
                sub_routes,
                call_level + 1,
            ))
            .await;
        }
    }

    let Some(asset) = build_result.output.get(&effective_path).cloned() else {
        return directory_listing_or_404(state, &effective_path, accept, &request_id).await;
    };

    dispatch_asset(state, asset, &method, &uri, &headers, body, &request_id).await
}

/// Step 4: re-reconcile the build-match registry against the current
/// manifest and file index before routing, so an entrypoint that just
/// appeared on disk is routable on the very next request rather than only
/// after the next FS-watch debounce batch fires (§4.7 step 4).
async fn refresh_registry(state: &Arc<ServerState>) {
    let outcome = {
        let mut core = state.core.lock().await;
        let expected = match crate::registry::expected_bindings(&state.manifest, &core.index) {
            Ok(expected) => expected,
            Err(err) => {
                tracing::error!(error = %err, "error computing expected bindings while refreshing registry");
                return;
            }
        };
        match core.registry.reconcile(expected, state.resolver.as_ref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "error reconciling registry while refreshing registry");
                return;
            }
        }
    };

    for builder in outcome.shutdown {
        builder.shutdown().await;
    }
    for src in outcome.pending_blocking_builds {
        state.scheduler.gate.begin().await;
        trigger_build(state, &src, ALL_KEY, &src).await;
        state.scheduler.gate.end().await;
    }
}

struct RegistryProbeBound<'a>(&'a Registry);

impl router::AssetProbe for RegistryProbeBound<'_> {
    fn exists(&self, path: &str) -> bool {
        self.0.matches().any(|m| m.build_results.values().any(|r| r.output.contains_key(path)))
    }
}

fn normalize_slashes(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        collapsed.push(ch);
    }
    collapsed
}

fn is_absolute_url(dest: &str) -> bool {
    dest.starts_with("http://") || dest.starts_with("https://")
}

fn has_no_cache(headers: &HeaderMap) -> bool {
    let pragma = headers.get("pragma").and_then(|v| v.to_str().ok());
    let cache_control = headers.get("cache-control").and_then(|v| v.to_str().ok());
    pragma == Some("no-cache") || cache_control.is_some_and(|v| v.contains("no-cache"))
}

/// Resolve the build match owning `path`, triggering a build first if the
/// caller asked for `no_cache` or no asset is currently published there.
async fn resolve_or_build(state: &Arc<ServerState>, path: &str, no_cache: bool) -> Option<(String, BuildResult)> {
    let existing = {
        let core = state.core.lock().await;
        find_owning_match(&core.registry, path)
    };

    let needs_build = no_cache || existing.is_none();
    if !needs_build {
        return existing;
    }

    let Some((src, key)) = target_for_build(state, path).await else {
        return existing;
    };

    trigger_build(state, &src, &key, path).await;

    let core = state.core.lock().await;
    find_owning_match(&core.registry, path)
}

fn find_owning_match(registry: &Registry, path: &str) -> Option<(String, BuildResult)> {
    for build_match in registry.matches() {
        for result in build_match.build_results.values() {
            if result.output.contains_key(path) {
                return Some((build_match.src.clone(), result.clone()));
            }
        }
    }
    None
}

/// Pick the (src, build-result key) that *should* own `path`, by finding
/// a registered entrypoint prefix even if nothing has been built there
/// yet. Falls back to the static catch-all.
async fn target_for_build(state: &Arc<ServerState>, path: &str) -> Option<(String, String)> {
    let core = state.core.lock().await;
    let trimmed = path.trim_start_matches('/');
    core.registry
        .matches()
        .find(|m| {
            path == m.src
                || trimmed.starts_with(m.src.trim_start_matches('/'))
                || crate::registry::has_glob_meta(&m.src)
        })
        .map(|m| (m.src.clone(), ALL_KEY.to_string()))
}

pub(crate) async fn trigger_build(state: &Arc<ServerState>, src: &str, key: &str, request_path: &str) {
    let (builder, config, last_build) = {
        let core = state.core.lock().await;
        let Some(build_match) = core.registry.get(src) else {
            return;
        };
        (build_match.builder.clone(), build_match.config.clone(), build_match.build_timestamp)
    };

    let scheduled_key = build_key(src, key);
    let state_for_build = state.clone();
    let src_owned = src.to_string();
    let key_owned = key.to_string();
    let request_path_owned = request_path.to_string();

    let outcome = state
        .scheduler
        .schedule(scheduled_key, last_build, move || async move {
            // Teardown on rebuild (§4.4): drop stale output only once the
            // build is actually about to run, not merely requested — a
            // request that lands inside the cooldown window must never
            // see the previously-served asset vanish.
            let files = {
                let mut core = state_for_build.core.lock().await;
                if let Some(build_match) = core.registry.get_mut(&src_owned) {
                    build_match.build_results.remove(&key_owned);
                }
                Arc::new(core.index.snapshot())
            };
            let ctx = BuildContext {
                files,
                entrypoint: std::path::PathBuf::from(&src_owned),
                config,
                work_path: state_for_build.root.clone(),
                env: state_for_build.env.clone(),
                build_env: state_for_build.build_env.clone(),
                request_path: if key_owned == ALL_KEY { None } else { Some(request_path_owned.clone()) },
            };
            builder.build(&ctx).await
        })
        .await;

    let Some(outcome) = outcome else {
        return;
    };

    match outcome.as_ref() {
        Ok(result) => {
            let mut core = state.core.lock().await;
            if let Some(build_match) = core.registry.get_mut(src) {
                build_match.build_results.insert(key.to_string(), result.clone());
                build_match.build_timestamp = Some(Instant::now());
            }
        }
        Err(err) => {
            tracing::error!(src, key, error = %err, "build failed");
        }
    }
}

async fn directory_listing_or_404(state: &Arc<ServerState>, path: &str, accept: Option<&str>, request_id: &str) -> Response {
    // §9 open question: directory listings reflect the match registry
    // (routable entrypoints), not the raw file index.
    let entries: Vec<String> = {
        let core = state.core.lock().await;
        core.registry
            .matches()
            .filter(|m| m.src.starts_with(path.trim_start_matches('/')))
            .map(|m| m.src.clone())
            .collect()
    };

    if entries.is_empty() {
        return response::render_error(accept, ErrorKind::NotFound, "The page could not be found", request_id);
    }

    let mut body = String::from("<!DOCTYPE html><html><head><title>Index</title></head><body><ul>");
    for entry in entries {
        body.push_str(&format!("<li><a href=\"/{entry}\">{entry}</a></li>"));
    }
    body.push_str("</ul></body></html>");

    let mut response = axum::response::Html(body).into_response();
    crate::response::apply_standard_headers(response.headers_mut(), request_id);
    response
}

async fn proxy_request(
    state: &Arc<ServerState>,
    method: &Method,
    dest_url: &str,
    headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Response {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let host = headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or("localhost").to_string();

    match crate::proxy::forward(
        &state.proxy_clients,
        dest_url,
        method.clone(),
        headers.clone(),
        body,
        &client_ip,
        &host,
        request_id,
    )
    .await
    {
        Ok(Some(proxied)) => {
            let mut builder = Response::builder().status(proxied.status);
            for (name, value) in proxied.headers.iter() {
                builder = builder.header(name, value);
            }
            let mut response = builder.body(Body::from(proxied.body)).unwrap_or_else(|_| {
                response::render_error(None, ErrorKind::Internal, "error building proxy response", request_id)
            });
            crate::response::apply_standard_headers(response.headers_mut(), request_id);
            response
        }
        Ok(None) => {
            // ECONNRESET swallowed per §7: the client simply sees nothing further.
            let mut response = StatusCode::BAD_GATEWAY.into_response();
            crate::response::apply_standard_headers(response.headers_mut(), request_id);
            response
        }
        Err(err) => {
            tracing::error!(error = %err, dest_url, "error proxying request");
            response::render_error(None, ErrorKind::BadGateway, "error proxying request", request_id)
        }
    }
}

async fn dispatch_asset(
    _state: &Arc<ServerState>,
    asset: Asset,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Response {
    let mut response = match asset {
        Asset::FileFsRef { fs_path, mode: _ } => match tokio::fs::read(&fs_path).await {
            Ok(data) => {
                let content_type = mime_guess::from_path(&fs_path).first_or_octet_stream();
                let mut response = Response::new(Body::from(data));
                response
                    .headers_mut()
                    .insert("content-type", content_type.as_ref().parse().unwrap_or_else(|_| {
                        axum::http::HeaderValue::from_static("application/octet-stream")
                    }));
                response
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %fs_path.display(), "error reading static file");
                return response::render_error(
                    headers.get("accept").and_then(|v| v.to_str().ok()),
                    ErrorKind::NotFound,
                    "The page could not be found",
                    request_id,
                );
            }
        },
        Asset::FileBlob { data, content_type } => {
            let mut response = Response::new(Body::from(data));
            let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
            response.headers_mut().insert(
                "content-type",
                content_type.parse().unwrap_or_else(|_| axum::http::HeaderValue::from_static("application/octet-stream")),
            );
            response
        }
        Asset::Lambda { handler, .. } => {
            let mut header_map = HashMap::new();
            for (name, value) in headers.iter() {
                if let Ok(value) = value.to_str() {
                    header_map.insert(name.as_str().to_string(), value.to_string());
                }
            }
            let client_ip = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("127.0.0.1")
                .to_string();
            let host = headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or("localhost").to_string();
            for (name, value) in crate::proxy::upstream_headers(&client_ip, &host, request_id) {
                header_map.insert(name.to_string(), value);
            }
            let payload = crate::lambda::InvokePayload::new(
                method.to_string(),
                host,
                uri.path().to_string(),
                header_map,
                &body,
            );
            match handler.invoke(payload).await {
                Ok(result) => match result.decode_body() {
                    Ok(body) => {
                        let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
                        let mut response = Response::new(Body::from(body));
                        *response.status_mut() = status;
                        for (key, value) in &result.headers {
                            if let (Ok(name), Ok(value)) = (
                                axum::http::HeaderName::from_bytes(key.as_bytes()),
                                axum::http::HeaderValue::from_str(value),
                            ) {
                                response.headers_mut().insert(name, value);
                            }
                        }
                        response
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "lambda returned undecodable body");
                        response::render_error(None, ErrorKind::BadGateway, "NO_STATUS_CODE_FROM_LAMBDA", request_id)
                    }
                },
                Err(err) => {
                    tracing::error!(error = %err, "lambda invocation failed");
                    response::render_error(None, ErrorKind::BadGateway, "NO_STATUS_CODE_FROM_LAMBDA", request_id)
                }
            }
        }
    };

    crate::response::apply_standard_headers(response.headers_mut(), request_id);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_slashes_collapses_repeats() {
        assert_eq!(normalize_slashes("//a//b"), "/a/b");
        assert_eq!(normalize_slashes("/a/b"), "/a/b");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_slashes("//a///b//");
        let twice = normalize_slashes(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn absolute_urls_are_detected() {
        assert!(is_absolute_url("https://example.com/x"));
        assert!(is_absolute_url("http://example.com/x"));
        assert!(!is_absolute_url("/local/path"));
    }

    #[test]
    fn no_cache_header_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("pragma", "no-cache".parse().unwrap());
        assert!(has_no_cache(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("cache-control", "no-cache, max-age=0".parse().unwrap());
        assert!(has_no_cache(&headers));

        assert!(!has_no_cache(&HeaderMap::new()));
    }
}

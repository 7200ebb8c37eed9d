//! Reverse proxying to an absolute-URL route destination (§4.7 step 5).
//! One `reqwest::Client` is cached per distinct TLS/redirect policy rather
//! than built fresh on every request.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::redirect::Policy;
use reqwest::Client;

/// The policy knobs that distinguish one cached client from another.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
struct ClientKey {
    insecure: bool,
}

/// A small cache of `reqwest::Client`s, keyed by policy. Clients are
/// expensive to build (connection pools, TLS config) and cheap to clone,
/// so proxying never builds one per request.
#[derive(Default)]
pub struct ProxyClients {
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl ProxyClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: ClientKey) -> Result<Client> {
        let mut clients = self.clients.lock().expect("proxy client cache poisoned");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&key)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(key: &ClientKey) -> Result<Client> {
    let mut builder = Client::builder().redirect(Policy::none());
    if key.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().context("error building proxy client")
}

/// One proxied request's outcome.
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
}

/// The upstream forwarding headers required on every proxied/invoked
/// request (§6 "HTTP surface"): `Connection: close`,
/// `X-Forwarded-{Host,Proto,For}`, `X-Real-IP`,
/// `X-Now-{Trace,Deployment-Url,Id,Log-Id}`, `X-Zeit-Co-Forwarded-For`.
/// Shared between reverse-proxying and lambda invocation so both call
/// sites carry the full set.
pub fn upstream_headers(client_ip: &str, host: &str, request_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("connection", "close".to_string()),
        ("x-forwarded-host", host.to_string()),
        ("x-forwarded-proto", "http".to_string()),
        ("x-forwarded-for", client_ip.to_string()),
        ("x-real-ip", client_ip.to_string()),
        ("x-now-trace", "dev1".to_string()),
        ("x-now-deployment-url", host.to_string()),
        ("x-now-id", request_id.to_string()),
        ("x-now-log-id", request_id.to_string()),
        ("x-zeit-co-forwarded-for", client_ip.to_string()),
    ]
}

/// Forward `method`/`body`/`headers` to `dest_url`, adding the platform
/// forwarding headers (§6), and relay the response. A reset connection on
/// the remote end is reported as `None` so the caller can swallow it
/// quietly, per §7's transient-error handling.
#[tracing::instrument(level = "debug", skip(clients, headers, body))]
pub async fn forward(
    clients: &ProxyClients,
    dest_url: &str,
    method: Method,
    mut headers: HeaderMap,
    body: bytes::Bytes,
    client_ip: &str,
    host: &str,
    request_id: &str,
) -> Result<Option<ProxyResponse>> {
    for (name, value) in upstream_headers(client_ip, host, request_id) {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }

    let client = clients.get(ClientKey::default())?;
    let request = client
        .request(method, dest_url)
        .headers(headers)
        .body(body)
        .build()
        .with_context(|| format!("error building proxy request to {dest_url}"))?;

    match client.execute(request).await {
        Ok(response) => {
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .with_context(|| format!("error reading proxied response body from {dest_url}"))?;
            Ok(Some(ProxyResponse { status, headers, body }))
        }
        Err(err) if is_connection_reset(&err) => {
            tracing::debug!(url = dest_url, "proxied connection was reset by the peer");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("error proxying request to {dest_url}")),
    }
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    std::error::Error::source(err)
        .and_then(|src| src.downcast_ref::<std::io::Error>())
        .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::ConnectionReset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cache_reuses_client_for_same_key() {
        let clients = ProxyClients::new();
        clients.get(ClientKey::default()).unwrap();
        clients.get(ClientKey { insecure: false }).unwrap();
        assert_eq!(clients.clients.lock().unwrap().len(), 1);

        clients.get(ClientKey { insecure: true }).unwrap();
        assert_eq!(clients.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn upstream_headers_include_the_full_required_set() {
        let headers = upstream_headers("1.2.3.4", "example.test", "dev1:abcde-1-0123456789ab");
        let names: Vec<&str> = headers.iter().map(|(name, _)| *name).collect();
        for required in [
            "connection",
            "x-forwarded-host",
            "x-forwarded-proto",
            "x-forwarded-for",
            "x-real-ip",
            "x-now-trace",
            "x-now-deployment-url",
            "x-now-id",
            "x-now-log-id",
            "x-zeit-co-forwarded-for",
        ] {
            assert!(names.contains(&required), "missing header {required:?}");
        }
    }
}

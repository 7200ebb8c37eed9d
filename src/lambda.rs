//! The function ABI (§6): the JSON envelope invocable assets are called
//! with, and the result envelope they must return.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The payload passed to an invocable asset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokePayload {
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub encoding: String,
    pub body: String,
}

impl InvokePayload {
    pub fn new(method: String, host: String, path: String, headers: HashMap<String, String>, body: &[u8]) -> Self {
        Self {
            method,
            host,
            path,
            headers,
            encoding: "base64".to_string(),
            body: BASE64.encode(body),
        }
    }
}

/// The result an invocable asset must return.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeResult {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl InvokeResult {
    /// Decode `body` per `encoding`, defaulting to plain UTF-8 text.
    pub fn decode_body(&self) -> Result<Bytes> {
        match self.encoding.as_deref() {
            Some("base64") => BASE64
                .decode(&self.body)
                .map(Bytes::from)
                .context("invalid base64 in lambda response body"),
            _ => Ok(Bytes::from(self.body.clone().into_bytes())),
        }
    }
}

/// An invocable function artifact. Implementations own their own runtime
/// (an in-process closure, a subprocess, a WASM sandbox, ...); the core only
/// ever calls `invoke`.
#[async_trait]
pub trait LambdaFn: Send + Sync {
    async fn invoke(&self, payload: InvokePayload) -> Result<InvokeResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_base64_encodes_body() {
        let payload = InvokePayload::new(
            "POST".to_string(),
            "localhost".to_string(),
            "/fn".to_string(),
            HashMap::new(),
            b"hello",
        );
        assert_eq!(payload.encoding, "base64");
        assert_eq!(BASE64.decode(&payload.body).unwrap(), b"hello");
    }

    #[test]
    fn result_decodes_base64_body() {
        let result = InvokeResult {
            status_code: 202,
            headers: HashMap::new(),
            body: BASE64.encode(b"ok"),
            encoding: Some("base64".to_string()),
        };
        assert_eq!(result.decode_body().unwrap(), Bytes::from_static(b"ok"));
    }

    #[test]
    fn result_without_encoding_is_plain_text() {
        let result = InvokeResult {
            status_code: 200,
            headers: HashMap::new(),
            body: "plain".to_string(),
            encoding: None,
        };
        assert_eq!(result.decode_body().unwrap(), Bytes::from_static(b"plain"));
    }
}

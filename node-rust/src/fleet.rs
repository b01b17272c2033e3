//! Fleet REST transport.
//!
//! The remote fleet service is a byte-oriented HTTP collaborator: the core
//! only ever issues `GET`/`POST` with a bearer token. `FleetTransport` is
//! the seam — production uses reqwest, tests substitute a recording mock.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::errors::{NodeError, Result};

// ── Token source ──────────────────────────────────────────────────────────────

/// Bearer-token contract: `CARLINK_TOKEN`, falling back to the token file
/// the authorization flow maintains. Refresh is a collaborator concern.
#[derive(Debug, Clone)]
pub struct TokenSource {
    file: PathBuf,
}

impl TokenSource {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    pub fn bearer(&self) -> Result<String> {
        if let Ok(tok) = std::env::var("CARLINK_TOKEN") {
            if !tok.trim().is_empty() {
                return Ok(tok.trim().to_string());
            }
        }
        match std::fs::read_to_string(&self.file) {
            Ok(tok) if !tok.trim().is_empty() => Ok(tok.trim().to_string()),
            _ => Err(NodeError::Auth(format!(
                "no bearer token in CARLINK_TOKEN or {}",
                self.file.display()
            ))),
        }
    }
}

// ── Transport seam ────────────────────────────────────────────────────────────

#[async_trait]
pub trait FleetTransport: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value>;
    async fn post(&self, path: &str, body: Value) -> Result<Value>;
}

// ── Production client ─────────────────────────────────────────────────────────

pub struct FleetApi {
    http: reqwest::Client,
    base: String,
    token: TokenSource,
}

impl FleetApi {
    pub fn new(base: String, token: TokenSource) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http, base, token }
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let bearer = self.token.bearer()?;
        let mut req = self.http.request(method, &url).bearer_auth(bearer);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let text = resp.text().await?;
        debug!("fleet {path} → {status}");

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| NodeError::Decode(format!("fleet response: {e}")));
        }

        Err(match status.as_u16() {
            401 => NodeError::Auth(snippet(&text)),
            403 => NodeError::KeyNotEnrolled,
            404 if path.ends_with("/signed_command") => NodeError::KeyNotEnrolled,
            408 => NodeError::VehicleAsleep,
            429 => NodeError::RateLimited { retry_after_secs: retry_after.unwrap_or(60) },
            _ => NodeError::Transport(format!("HTTP {status}: {}", snippet(&text))),
        })
    }
}

fn snippet(text: &str) -> String {
    let t = text.trim();
    if t.len() > 200 { format!("{}…", &t[..200]) } else { t.to_string() }
}

#[async_trait]
impl FleetTransport for FleetApi {
    async fn get(&self, path: &str) -> Result<Value> {
        self.send(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(reqwest::Method::POST, path, Some(body)).await
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn vehicle_data_path(vin: &str, endpoints: &str) -> String {
    format!("/api/1/vehicles/{vin}/vehicle_data?endpoints={endpoints}")
}

pub fn command_path(vin: &str, name: &str) -> String {
    format!("/api/1/vehicles/{vin}/command/{name}")
}

pub fn signed_command_path(vin: &str) -> String {
    format!("/api/1/vehicles/{vin}/signed_command")
}

//! Agent gateway client.
//!
//! Maintains one JSON-RPC-over-WebSocket connection to the remote gateway,
//! as a client with role `node`. Lifecycle:
//!
//! ```text
//! Idle → Connecting → Handshaking → Active
//!            ▲              │          │
//!            └── Backoff ◀──┴──────────┘ (any failure / close)
//! ```
//!
//! The handshake answers the gateway's `connect.challenge` nonce with an
//! Ed25519 signature over the v2 connect line. Reconnects back off
//! exponentially (1 s base, ×2, 60 s cap, up to 10 % jitter); the device
//! identity persists across restarts so the gateway sees a stable node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::errors::{NodeError, Result};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const BACKOFF_JITTER: f64 = 0.10;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

const ROLE: &str = "node";
const MODE: &str = "client";
const SCOPES: [&str; 2] = ["node.telemetry", "node.command"];

// ── Wire envelope ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

// ── Config & client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub client_id: String,
    pub token: String,
}

pub struct GatewayClient {
    cfg: GatewayConfig,
    device_key: SigningKey,
    device_id: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    out_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

/// Stable device id: base64url SHA-256 of the Ed25519 public key.
pub fn device_id(key: &SigningKey) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key.verifying_key().to_bytes()))
}

/// The exact line signed during the connect handshake.
pub fn connect_line(
    device_id: &str,
    client_id: &str,
    signed_at: i64,
    token: &str,
    nonce: &str,
) -> String {
    format!(
        "v2|{device_id}|{client_id}|{MODE}|{ROLE}|{}|{signed_at}|{token}|{nonce}",
        SCOPES.join(",")
    )
}

/// Exponential reconnect delay for the given consecutive-failure count.
/// `jitter_frac` is sampled in `[0, BACKOFF_JITTER)` by the caller.
pub fn backoff_delay(attempt: u32, jitter_frac: f64) -> Duration {
    let base = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = base.min(BACKOFF_MAX.as_secs_f64());
    Duration::from_secs_f64(capped * (1.0 + jitter_frac))
}

impl GatewayClient {
    pub fn new(cfg: GatewayConfig, device_key: SigningKey) -> Arc<Self> {
        let (connected_tx, connected_rx) = watch::channel(false);
        let device_id = device_id(&device_key);
        Arc::new(Self {
            cfg,
            device_key,
            device_id,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            out_tx: Mutex::new(None),
            connected_tx,
            connected_rx,
        })
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, envelope: Envelope) -> bool {
        let tx = self.out_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(envelope).await.is_ok(),
            None => false,
        }
    }

    /// Fire-and-forget event wrapped in a `req:agent` request.
    pub async fn notify(&self, event: &str, data: Value) {
        let env = Envelope {
            kind: "req".into(),
            id: Some(json!(self.fresh_id())),
            method: Some("req:agent".into()),
            params: Some(json!({ "event": event, "data": data })),
            ..Default::default()
        };
        if !self.send(env).await {
            debug!("Gateway offline, dropped event {event}");
        }
    }

    /// Correlated request. The pending slot outlives a timed-out caller and
    /// is reclaimed when the server answers or the connection resets.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let env = Envelope {
            kind: "req".into(),
            id: Some(json!(id)),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        };
        if !self.send(env).await {
            self.pending.lock().await.remove(&id);
            return Err(NodeError::Transport("gateway not connected".into()));
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::Transport("gateway connection reset".into())),
            Err(_) => Err(NodeError::Transport(format!("gateway request {method} timed out"))),
        }
    }

    // ── Connection loop ───────────────────────────────────────────────────

    pub async fn run(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let session_start = tokio::time::Instant::now();
            match self.clone().session(&dispatcher, &mut shutdown).await {
                Ok(true) => {
                    info!("Gateway connection closed for shutdown");
                    break;
                }
                Ok(false) => {
                    warn!("Gateway connection lost");
                }
                Err(e) => {
                    warn!("Gateway connect failed: {e}");
                }
            }
            // A session that held for a while earns a fresh backoff ladder.
            if session_start.elapsed() >= BACKOFF_MAX {
                failures = 0;
            }

            let jitter = rand::random::<f64>() * BACKOFF_JITTER;
            let delay = backoff_delay(failures, jitter);
            failures = failures.saturating_add(1);
            info!("Gateway reconnect in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One full connection: dial, handshake, pump until close.
    /// Returns `Ok(true)` on a shutdown-initiated close.
    async fn session(
        self: Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        info!("Connecting to gateway {}", self.cfg.url);
        let (ws, _) = connect_async(&self.cfg.url)
            .await
            .map_err(|e| NodeError::Transport(format!("gateway dial: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        // ── Handshaking ───────────────────────────────────────────────────
        let authenticated = timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                let msg = stream
                    .next()
                    .await
                    .ok_or_else(|| NodeError::Transport("gateway closed during handshake".into()))?
                    .map_err(|e| NodeError::Transport(format!("gateway read: {e}")))?;
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                let env: Envelope = serde_json::from_str(&text)
                    .map_err(|e| NodeError::Decode(format!("gateway envelope: {e}")))?;
                match env.method.as_deref() {
                    Some("connect.challenge") => {
                        let nonce = env
                            .params
                            .as_ref()
                            .and_then(|p| p["nonce"].as_str())
                            .ok_or_else(|| {
                                NodeError::Decode("connect.challenge without nonce".into())
                            })?
                            .to_string();
                        let connect = self.build_connect(&nonce);
                        let text = serde_json::to_string(&connect)
                            .map_err(|e| NodeError::Decode(e.to_string()))?;
                        sink.send(WsMessage::Text(text))
                            .await
                            .map_err(|e| NodeError::Transport(format!("gateway write: {e}")))?;
                    }
                    Some("hello-ok") => return Ok::<(), NodeError>(()),
                    _ => debug!("Ignoring pre-auth message: {text}"),
                }
            }
        })
        .await;
        match authenticated {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(NodeError::Transport("gateway handshake timed out".into())),
        }
        info!("Gateway handshake complete ({})", self.device_id);

        // ── Active ────────────────────────────────────────────────────────
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
        *self.out_tx.lock().await = Some(out_tx);
        let _ = self.connected_tx.send(true);
        self.notify("node.connected", json!({ "deviceId": self.device_id })).await;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let graceful = loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(env) = outbound else { break false };
                    let Ok(text) = serde_json::to_string(&env) else { continue };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!("Gateway write failed: {e}");
                        break false;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => self.handle_inbound(&text, dispatcher).await,
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = sink.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Gateway read failed: {e}");
                            break false;
                        }
                    }
                }
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break false;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.notify("node.disconnecting", json!({})).await;
                        // Flush the farewell before closing.
                        while let Ok(env) = out_rx.try_recv() {
                            if let Ok(text) = serde_json::to_string(&env) {
                                let _ = sink.send(WsMessage::Text(text)).await;
                            }
                        }
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break true;
                    }
                }
            }
        };

        // Teardown: callers awaiting replies learn the connection is gone.
        *self.out_tx.lock().await = None;
        let _ = self.connected_tx.send(false);
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(NodeError::Transport("gateway connection reset".into())));
        }
        Ok(graceful)
    }

    fn build_connect(&self, nonce: &str) -> Envelope {
        let signed_at = chrono::Utc::now().timestamp_millis();
        let line = connect_line(&self.device_id, &self.cfg.client_id, signed_at, &self.cfg.token, nonce);
        let signature = URL_SAFE_NO_PAD.encode(self.device_key.sign(line.as_bytes()).to_bytes());
        Envelope {
            kind: "req".into(),
            id: Some(json!(self.fresh_id())),
            method: Some("connect".into()),
            params: Some(json!({
                "role": ROLE,
                "scopes": SCOPES,
                "signedAt": signed_at,
                "nonce": nonce,
                "token": self.cfg.token,
                "client": { "id": self.cfg.client_id, "mode": MODE },
                "device": {
                    "id": self.device_id,
                    "publicKey": URL_SAFE_NO_PAD.encode(self.device_key.verifying_key().to_bytes()),
                    "signature": signature,
                },
            })),
            ..Default::default()
        }
    }

    async fn handle_inbound(self: &Arc<Self>, text: &str, dispatcher: &Arc<Dispatcher>) {
        let env: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                debug!("Gateway sent undecodable frame: {e}");
                return;
            }
        };

        match (env.kind.as_str(), env.method.as_deref()) {
            ("res", _) => {
                let Some(id) = env.id.as_ref().and_then(Value::as_u64) else {
                    return;
                };
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let result = match env.error {
                        Some(err) => Err(NodeError::Transport(format!(
                            "gateway error {}: {}",
                            err.code, err.message
                        ))),
                        None => Ok(env.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            (_, Some("node.invoke.request")) => {
                let params = env.params.unwrap_or(Value::Null);
                let this = self.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let invoke_id = params["id"].clone();
                    let method = params["method"].as_str().unwrap_or_default().to_string();
                    let args = params.get("params").cloned().unwrap_or(json!({}));
                    let result = dispatcher.dispatch(&method, args).await;
                    let reply = Envelope {
                        kind: "req".into(),
                        id: Some(json!(this.fresh_id())),
                        method: Some("node.invoke.result".into()),
                        params: Some(json!({ "id": invoke_id, "result": result })),
                        ..Default::default()
                    };
                    this.send(reply).await;
                });
            }
            _ => debug!("Ignoring gateway message: {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn backoff_ladder_doubles_to_the_cap() {
        assert_eq!(backoff_delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 0.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, 0.0), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, 0.0), Duration::from_secs(60));
        assert_eq!(backoff_delay(30, 0.0), Duration::from_secs(60));
    }

    #[test]
    fn backoff_jitter_stays_within_ten_percent() {
        let lo = backoff_delay(0, 0.0);
        let hi = backoff_delay(0, BACKOFF_JITTER);
        assert_eq!(lo, Duration::from_secs(1));
        assert!(hi <= Duration::from_millis(1100));
        assert!(hi > lo);
    }

    #[test]
    fn connect_line_shape_and_signature() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let did = device_id(&key);
        let line = connect_line(&did, "carlink-node", 1_700_000_000_000, "tok", "n0nce");
        assert_eq!(
            line,
            format!("v2|{did}|carlink-node|client|node|node.telemetry,node.command|1700000000000|tok|n0nce")
        );

        let sig = key.sign(line.as_bytes());
        key.verifying_key().verify(line.as_bytes(), &sig).unwrap();
    }

    #[test]
    fn device_id_is_stable_and_url_safe() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let a = device_id(&key);
        let b = device_id(&key);
        assert_eq!(a, b);
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        // 32-byte digest, base64url unpadded.
        assert_eq!(a.len(), 43);
    }
}

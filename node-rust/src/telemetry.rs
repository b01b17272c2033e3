//! Telemetry receiver.
//!
//! Terminates the vehicle's push stream: an axum WebSocket listener on a
//! local port (TLS lives in the tunnel in front of us). On connect the
//! server issues a nonce; the first inbound message must be a
//! `HelloRequest` whose Schnorr signature over that nonce verifies under
//! the vehicle's registered key, or the socket closes with 1008.
//!
//! Decode failures on individual frames are counted and logged, never
//! fatal; socket errors drop the connection and the listener keeps
//! accepting reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use k256::schnorr::signature::Verifier;
use k256::schnorr::{Signature, VerifyingKey};
use prost::Message as _;
use rand::RngCore;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vehicle_types::wire::{HelloChallenge, HelloRequest};

use crate::codec::decode_frame;
use crate::errors::NodeError;
use crate::fanout::Fanout;
use crate::mapper::TelemetryMapper;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Receiver {
    vin: String,
    vehicle_key: Option<VerifyingKey>,
    mapper: TelemetryMapper,
    fanout: Arc<Fanout>,
    started_at: Instant,
    frames_seen: AtomicU64,
    decode_errors: AtomicU64,
}

impl Receiver {
    pub fn new(vin: &str, vehicle_key: Option<VerifyingKey>, fanout: Arc<Fanout>) -> Arc<Self> {
        Arc::new(Self {
            vin: vin.to_string(),
            vehicle_key,
            mapper: TelemetryMapper,
            fanout,
            started_at: Instant::now(),
            frames_seen: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        })
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

/// Parse the configured hex-encoded 32-byte Schnorr verifying key.
pub fn parse_vehicle_key(hex_key: &str) -> Result<VerifyingKey, NodeError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| NodeError::Decode(format!("vehicle key hex: {e}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| NodeError::Decode(format!("vehicle key: {e}")))
}

pub fn router(receiver: Arc<Receiver>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(receiver)
}

/// Bind and serve until the shutdown flag flips.
pub async fn serve(
    receiver: Arc<Receiver>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("📡 Telemetry listener on {addr}");
    axum::serve(listener, router(receiver))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn health(State(receiver): State<Arc<Receiver>>) -> axum::Json<serde_json::Value> {
    let sinks: Vec<_> = receiver
        .fanout
        .stats()
        .into_iter()
        .map(|(name, delivered, dropped)| {
            json!({ "name": name, "delivered": delivered, "dropped": dropped })
        })
        .collect();
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "vin": receiver.vin,
        "uptimeSecs": receiver.started_at.elapsed().as_secs(),
        "framesSeen": receiver.frames_seen(),
        "decodeErrors": receiver.decode_errors(),
        "sinks": sinks,
    }))
}

async fn ws_upgrade(State(receiver): State<Arc<Receiver>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_vehicle(socket, receiver))
}

async fn handle_vehicle(mut socket: WebSocket, receiver: Arc<Receiver>) {
    // Challenge first: the vehicle proves key possession before any frame
    // is accepted.
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let challenge = HelloChallenge { nonce: nonce.to_vec() }.encode_to_vec();
    if socket.send(Message::Binary(challenge)).await.is_err() {
        return;
    }

    let hello = tokio::time::timeout(HELLO_TIMEOUT, socket.recv()).await;
    let hello_bytes = match hello {
        Ok(Some(Ok(Message::Binary(b)))) => b,
        Ok(_) => {
            warn!("Vehicle connection sent no binary hello");
            close_policy_violation(socket, "expected hello").await;
            return;
        }
        Err(_) => {
            warn!("Vehicle connection timed out before hello");
            close_policy_violation(socket, "hello timeout").await;
            return;
        }
    };

    match verify_hello(&receiver.vin, receiver.vehicle_key.as_ref(), &hello_bytes, &nonce) {
        Ok(vin) => info!("🚗 Vehicle authenticated: {vin}"),
        Err(e) => {
            warn!("Vehicle hello rejected: {e}");
            close_policy_violation(socket, "hello verification failed").await;
            return;
        }
    }

    // Frame loop: per-frame decode errors are counted, the stream lives on.
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Binary(bytes)) => {
                match decode_frame(&bytes, &receiver.mapper, &receiver.vin) {
                    Ok(frame) => {
                        receiver.frames_seen.fetch_add(1, Ordering::Relaxed);
                        receiver.fanout.publish(frame);
                    }
                    Err(e) => {
                        receiver.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Frame decode failed: {e}");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Vehicle socket error: {e}");
                break;
            }
        }
    }
    info!("Vehicle stream closed; listening for reconnect");
}

async fn close_policy_violation(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

/// Check the claimed VIN and the Schnorr signature over the server nonce.
fn verify_hello(
    expected_vin: &str,
    key: Option<&VerifyingKey>,
    hello_bytes: &[u8],
    nonce: &[u8],
) -> Result<String, NodeError> {
    let hello = HelloRequest::decode(hello_bytes)
        .map_err(|e| NodeError::Decode(format!("hello decode: {e}")))?;
    if hello.vin != expected_vin {
        return Err(NodeError::Decode(format!(
            "hello claimed VIN {} but this node serves {expected_vin}",
            hello.vin
        )));
    }
    let key = key.ok_or_else(|| {
        NodeError::Decode("no registered vehicle key; refusing all hellos".into())
    })?;
    let signature = Signature::try_from(hello.signature.as_slice())
        .map_err(|e| NodeError::Decode(format!("hello signature: {e}")))?;
    key.verify(nonce, &signature)
        .map_err(|_| NodeError::Decode("hello signature did not verify".into()))?;
    Ok(hello.vin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::schnorr::signature::Signer;
    use k256::schnorr::SigningKey;

    const VIN: &str = "5YJ3E1EA1NF000000";

    fn hello(vin: &str, key: &SigningKey, nonce: &[u8]) -> Vec<u8> {
        let signature: Signature = key.sign(nonce);
        HelloRequest {
            vin: vin.to_string(),
            signature: signature.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    #[test]
    fn valid_hello_verifies() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let nonce = [7u8; 32];
        let bytes = hello(VIN, &key, &nonce);
        let vin = verify_hello(VIN, Some(key.verifying_key()), &bytes, &nonce).unwrap();
        assert_eq!(vin, VIN);
    }

    #[test]
    fn wrong_vin_is_rejected() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let nonce = [7u8; 32];
        let bytes = hello("5YJ3E1EA1NF999999", &key, &nonce);
        assert!(verify_hello(VIN, Some(key.verifying_key()), &bytes, &nonce).is_err());
    }

    #[test]
    fn signature_over_wrong_nonce_is_rejected() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let bytes = hello(VIN, &key, &[1u8; 32]);
        assert!(verify_hello(VIN, Some(key.verifying_key()), &bytes, &[2u8; 32]).is_err());
    }

    #[test]
    fn foreign_key_is_rejected() {
        let vehicle = SigningKey::random(&mut rand::rngs::OsRng);
        let imposter = SigningKey::random(&mut rand::rngs::OsRng);
        let nonce = [7u8; 32];
        let bytes = hello(VIN, &imposter, &nonce);
        assert!(verify_hello(VIN, Some(vehicle.verifying_key()), &bytes, &nonce).is_err());
    }

    #[test]
    fn missing_registered_key_refuses_hello() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let nonce = [7u8; 32];
        let bytes = hello(VIN, &key, &nonce);
        assert!(verify_hello(VIN, None, &bytes, &nonce).is_err());
    }

    #[test]
    fn vehicle_key_hex_roundtrip() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let hex_key = hex::encode(key.verifying_key().to_bytes());
        let parsed = parse_vehicle_key(&hex_key).unwrap();
        assert_eq!(parsed.to_bytes(), key.verifying_key().to_bytes());
        assert!(parse_vehicle_key("not-hex").is_err());
    }
}

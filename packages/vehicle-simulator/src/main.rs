//! main.rs — vehicle simulator entry point
//!
//! Plays the vehicle side of the push protocol against a running node:
//!   1. Dial the node's telemetry WebSocket
//!   2. Answer the server's nonce with a Schnorr signature (hello)
//!   3. Stream protobuf frames from the drive/charge/sentry model
//!
//! The node only accepts hellos from its registered vehicle key, so on
//! startup the simulator prints the verifying key to export as
//! `CARLINK_VEHICLE_KEY` before starting the node.

mod drive_sim;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use k256::schnorr::signature::Signer;
use k256::schnorr::{Signature, SigningKey};
use prost::Message as _;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use vehicle_types::wire::{HelloChallenge, HelloRequest, TelemetryPayload};

use drive_sim::{FullConfig, Scenario, VehicleSim};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vehicle-sim", about = "Carlink fake-vehicle push stream")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Node telemetry WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:4433/")]
    node_url: String,
    /// Hex 32-byte Schnorr key seed; omit for a fresh ephemeral key
    #[arg(long)]
    key_seed: Option<String>,
    /// Scenario to play
    #[arg(long, value_enum, default_value = "drive")]
    scenario: Scenario,
    /// Stop after this many frames (0 = run forever)
    #[arg(long, default_value = "0")]
    frames: u64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn load_key(seed_hex: Option<&str>) -> SigningKey {
    match seed_hex {
        Some(hex_seed) => {
            let bytes = hex::decode(hex_seed.trim()).expect("--key-seed must be hex");
            SigningKey::from_bytes(&bytes).expect("--key-seed must be a valid 32-byte scalar")
        }
        None => SigningKey::random(&mut rand::rngs::OsRng),
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vehicle_sim=info,vehicle_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).expect("Invalid config.toml");

    let key = load_key(args.key_seed.as_deref());
    let pubkey_hex = hex::encode(key.verifying_key().to_bytes());
    info!("🚙 vehicle-sim starting — vin {}, scenario {:?}", cfg.vehicle.vin, args.scenario);
    info!("   vehicle key: export CARLINK_VEHICLE_KEY={pubkey_hex}");

    let interval_secs = 1.0 / cfg.simulation.update_rate_hz.max(0.1);
    let mut sim = VehicleSim::new(cfg, args.scenario);
    let mut sent: u64 = 0;

    // Reconnect forever; the node surviving restarts is part of what this
    // tool exercises.
    loop {
        match stream_session(&args, &key, &mut sim, interval_secs, &mut sent).await {
            Ok(()) => break,
            Err(e) => {
                warn!("Session ended: {e}; retrying in 3s");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
        if args.frames > 0 && sent >= args.frames {
            break;
        }
    }
    info!("vehicle-sim done ({sent} frames)");
}

async fn stream_session(
    args: &Args,
    key: &SigningKey,
    sim: &mut VehicleSim,
    interval_secs: f64,
    sent: &mut u64,
) -> Result<(), String> {
    let (ws, _) = connect_async(&args.node_url)
        .await
        .map_err(|e| format!("dial {}: {e}", args.node_url))?;
    let (mut sink, mut stream) = ws.split();
    info!("Connected to {}", args.node_url);

    // ── Hello handshake ───────────────────────────────────────────────────
    let challenge = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(b))) => break b,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(format!("read challenge: {e}")),
            None => return Err("closed before challenge".into()),
        }
    };
    let challenge =
        HelloChallenge::decode(challenge.as_slice()).map_err(|e| format!("challenge: {e}"))?;
    let signature: Signature = key.sign(&challenge.nonce);
    let hello = HelloRequest {
        vin: sim.vin().to_string(),
        signature: signature.to_bytes().to_vec(),
    };
    sink.send(Message::Binary(hello.encode_to_vec()))
        .await
        .map_err(|e| format!("send hello: {e}"))?;
    info!("Hello sent, streaming at {:.1}s intervals", interval_secs);

    // ── Frame loop ────────────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = TelemetryPayload {
                    data: sim.tick(interval_secs),
                    created_at: Some(::prost_types::Timestamp {
                        seconds: now_ms() / 1000,
                        nanos: ((now_ms() % 1000) * 1_000_000) as i32,
                    }),
                    vin: sim.vin().to_string(),
                };
                sink.send(Message::Binary(payload.encode_to_vec()))
                    .await
                    .map_err(|e| format!("send frame: {e}"))?;
                *sent += 1;
                if *sent % 60 == 0 {
                    info!("{} frames sent (soc {:.1}%)", sent, sim.soc());
                }
                if args.frames > 0 && *sent >= args.frames {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(f) = frame {
                            error!("Node closed the stream: {} {}", f.code, f.reason);
                        }
                        return Err("node closed the stream".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(format!("read: {e}")),
                    None => return Err("stream ended".into()),
                }
            }
        }
    }
}

mod audit;
mod cache;
mod codec;
mod commands;
mod config;
mod dashboard;
mod dispatch;
mod emitter;
mod errors;
mod fanout;
mod filter;
mod fleet;
mod gateway;
mod keys;
mod lifecycle;
mod mapper;
mod session;
mod sinks;
mod store;
mod telemetry;
mod tlv;
mod triggers;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};

use audit::{AuditEventType, AuditLog};
use cache::ResponseCache;
use commands::{CommandRouter, PolicyGate};
use config::NodeConfig;
use dashboard::DashboardSink;
use dispatch::Dispatcher;
use fanout::Fanout;
use filter::DualGateFilter;
use fleet::{FleetApi, FleetTransport, TokenSource};
use gateway::{GatewayClient, GatewayConfig};
use keys::KeyStore;
use lifecycle::{IngressProvider, StaticIngress, TelemetrySession};
use mapper::TelemetryMapper;
use session::SessionManager;
use sinks::{CacheSink, EmitterSink, StoreSink, TriggerSink};
use store::LatestStore;
use telemetry::{parse_vehicle_key, Receiver};
use triggers::TriggerEngine;

// ─── Shutdown ─────────────────────────────────────────────────────────────────

/// How long in-flight sink deliveries get to finish at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carlink_node=info".into()),
        )
        .init();

    let cfg = NodeConfig::from_env()?;
    info!(
        "🔌 Carlink node v{} starting — vin {} ({:?} tier)",
        env!("CARGO_PKG_VERSION"),
        cfg.vin,
        cfg.tier
    );

    let keystore = KeyStore::new(&cfg.config_dir);
    let audit = AuditLog::new(cfg.audit_file());
    audit
        .append(
            AuditEventType::NodeStart,
            json!({ "version": env!("CARGO_PKG_VERSION"), "vin": cfg.vin }),
        )
        .await;

    // Fleet REST transport + command signing
    let token = TokenSource::new(cfg.token_file());
    let fleet: Arc<dyn FleetTransport> = Arc::new(FleetApi::new(cfg.api_base.clone(), token));

    let command_key = keystore.load_command_key()?;
    let signing_available = command_key.is_some();
    if !signing_available {
        warn!(
            "No command key at {} — signed commands will be rejected with KeyNotEnrolled",
            keystore.command_key_path().display()
        );
    }
    let sessions = command_key.map(|key| Arc::new(SessionManager::new(fleet.clone(), key)));

    let cache = Arc::new(ResponseCache::new(&cfg.cache_dir));
    let router = Arc::new(CommandRouter::new(
        fleet.clone(),
        sessions,
        cache.clone(),
        audit.clone(),
        PolicyGate { tier: cfg.tier, signing_available },
    ));

    // Shared read state + trigger engine
    let store = LatestStore::new();
    let triggers = Arc::new(TriggerEngine::new(&cfg.vin, Some(cfg.triggers_file())));
    triggers.load().await;

    let dispatcher = Arc::new(Dispatcher::new(
        &cfg.vin,
        store.clone(),
        cache.clone(),
        fleet.clone(),
        router.clone(),
        triggers.clone(),
    ));

    // Fanout + built-in sinks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fanout = Arc::new(Fanout::new());
    let mut sink_handles = vec![
        fanout.attach(Arc::new(StoreSink { store: store.clone() }), shutdown_rx.clone()),
        fanout.attach(
            Arc::new(CacheSink { mapper: TelemetryMapper, cache: cache.clone() }),
            shutdown_rx.clone(),
        ),
        fanout.attach(Arc::new(TriggerSink { engine: triggers.clone() }), shutdown_rx.clone()),
    ];

    // Gateway client (optional)
    let mut gateway_handle = None;
    if let Some(url) = &cfg.gateway_url {
        let device_key = keystore.device_key()?;
        let client = GatewayClient::new(
            GatewayConfig {
                url: url.clone(),
                client_id: cfg.client_id.clone(),
                token: cfg.gateway_token.clone(),
            },
            device_key,
        );

        sink_handles.push(fanout.attach(
            Arc::new(EmitterSink {
                filter: DualGateFilter::new(NodeConfig::filter_specs()),
                gateway: client.clone(),
            }),
            shutdown_rx.clone(),
        ));

        // Trigger push channel: engine → gateway event
        let (push_tx, mut push_rx) = mpsc::channel(64);
        triggers.set_push_sink(push_tx);
        {
            let client = client.clone();
            tokio::spawn(async move {
                while let Some(notification) = push_rx.recv().await {
                    let data = serde_json::to_value(&notification).unwrap_or(json!({}));
                    client.notify("trigger.fired", data).await;
                }
            });
        }

        gateway_handle = Some(tokio::spawn(
            client.clone().run(dispatcher.clone(), shutdown_rx.clone()),
        ));
    } else {
        info!("No gateway configured — running local-only");
    }

    // Dashboard sink (TTY only)
    let dash = if dashboard::enabled(&cfg) {
        let sink = Arc::new(DashboardSink::new());
        sink_handles.push(fanout.attach(sink.clone(), shutdown_rx.clone()));
        Some(sink)
    } else {
        None
    };

    // Telemetry receiver
    let vehicle_key = match &cfg.vehicle_key_hex {
        Some(hex_key) => Some(parse_vehicle_key(hex_key)?),
        None => {
            warn!("CARLINK_VEHICLE_KEY unset — vehicle hellos will be refused");
            None
        }
    };
    let receiver = Receiver::new(&cfg.vin, vehicle_key, fanout.clone());
    let server_handle = {
        let receiver = receiver.clone();
        let shutdown = shutdown_rx.clone();
        let port = cfg.telemetry_port;
        tokio::spawn(async move {
            if let Err(e) = telemetry::serve(receiver, port, shutdown).await {
                error!("Telemetry listener failed: {e}");
            }
        })
    };

    // Tunnel & partner lifecycle (optional)
    let mut lifecycle_session = None;
    if let Some(hostname) = &cfg.public_hostname {
        let provider: Arc<dyn IngressProvider> = Arc::new(StaticIngress::new(hostname));
        match TelemetrySession::establish(
            fleet.clone(),
            provider,
            audit.clone(),
            &cfg.vin,
            cfg.telemetry_port,
            &NodeConfig::telemetry_fields(),
        )
        .await
        {
            Ok(session) => lifecycle_session = Some(session),
            Err(e) => warn!("Telemetry lifecycle not established: {e}"),
        }
    } else {
        info!("No public hostname configured — skipping partner registration");
    }

    info!("🚀 Node ready");
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Ordered exit: stop accepting telemetry, drain sinks, close the
    // gateway, then release the tunnel.
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = server_handle.await;
        for handle in sink_handles {
            let _ = handle.await;
        }
        if let Some(handle) = gateway_handle {
            let _ = handle.await;
        }
    };
    if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Drain exceeded {DRAIN_TIMEOUT:?}; abandoning in-flight deliveries");
    }

    if let Some(dash) = dash {
        dash.finish();
    }
    if let Some(mut session) = lifecycle_session {
        session.teardown().await;
    }
    info!("Node stopped cleanly");
    Ok(())
}

/// Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

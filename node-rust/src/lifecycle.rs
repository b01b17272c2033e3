//! Tunnel & partner lifecycle.
//!
//! A telemetry session is a scoped resource built in three steps — public
//! ingress, partner-hostname registration, vehicle telemetry config — and
//! torn down in exactly the reverse order. Teardown runs on every exit
//! path: explicitly on graceful shutdown, and from the drop guard when the
//! session is abandoned by a panic or cancellation. Teardown steps are
//! best-effort: a failing step logs and the remaining steps still run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use vehicle_types::Field;

use crate::audit::AuditLog;
use crate::errors::Result;
use crate::fleet::FleetTransport;

// ── Ingress seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Ingress {
    pub id: String,
    pub hostname: String,
}

/// Allocates a public HTTPS ingress that forwards to the local telemetry
/// port. Real tunnel providers are collaborators behind this seam.
#[async_trait]
pub trait IngressProvider: Send + Sync {
    async fn allocate(&self, local_port: u16) -> Result<Ingress>;
    async fn release(&self, ingress: &Ingress) -> Result<()>;
}

/// Deployment behind an operator-managed reverse proxy: the hostname is
/// pre-provisioned and allocation is bookkeeping only.
pub struct StaticIngress {
    hostname: String,
}

impl StaticIngress {
    pub fn new(hostname: &str) -> Self {
        Self { hostname: hostname.to_string() }
    }
}

#[async_trait]
impl IngressProvider for StaticIngress {
    async fn allocate(&self, local_port: u16) -> Result<Ingress> {
        info!("Using static ingress {} → local port {local_port}", self.hostname);
        Ok(Ingress { id: Uuid::new_v4().to_string(), hostname: self.hostname.clone() })
    }

    async fn release(&self, _ingress: &Ingress) -> Result<()> {
        Ok(())
    }
}

// ── Telemetry session ─────────────────────────────────────────────────────────

fn telemetry_config_path(vin: &str) -> String {
    format!("/api/1/vehicles/{vin}/fleet_telemetry_config")
}

struct Established {
    ingress: Ingress,
    prior_hostname: Option<String>,
}

pub struct TelemetrySession {
    fleet: Arc<dyn FleetTransport>,
    provider: Arc<dyn IngressProvider>,
    audit: AuditLog,
    vin: String,
    state: Option<Established>,
}

impl TelemetrySession {
    /// Build the session: allocate ingress, register the hostname, push the
    /// telemetry configuration. A failure part-way unwinds the steps that
    /// already succeeded before returning the error.
    pub async fn establish(
        fleet: Arc<dyn FleetTransport>,
        provider: Arc<dyn IngressProvider>,
        audit: AuditLog,
        vin: &str,
        local_port: u16,
        fields: &[(Field, u32)],
    ) -> Result<TelemetrySession> {
        let ingress = provider.allocate(local_port).await?;
        audit
            .log_lifecycle("ingress_allocated", json!({ "hostname": ingress.hostname }))
            .await;

        // Remember whatever partner hostname was registered before us, so
        // teardown can put it back.
        let prior_hostname = fleet
            .get(&telemetry_config_path(vin))
            .await
            .ok()
            .and_then(|v| {
                v.pointer("/response/config/hostname")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            })
            .filter(|h| h != &ingress.hostname);

        if let Err(e) = fleet
            .post("/api/1/partner_accounts/public_key", json!({ "domain": ingress.hostname }))
            .await
        {
            let _ = provider.release(&ingress).await;
            return Err(e);
        }
        audit
            .log_lifecycle("partner_registered", json!({ "hostname": ingress.hostname }))
            .await;

        let field_config: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(f, interval)| (f.name().to_string(), json!({ "interval_seconds": interval })))
            .collect();
        let config = json!({
            "vins": [vin],
            "config": {
                "hostname": ingress.hostname,
                "port": 443,
                "fields": field_config,
            }
        });
        if let Err(e) = fleet.post(&telemetry_config_path(vin), config).await {
            if let Some(prior) = &prior_hostname {
                let _ = fleet
                    .post("/api/1/partner_accounts/public_key", json!({ "domain": prior }))
                    .await;
            }
            let _ = provider.release(&ingress).await;
            return Err(e);
        }
        audit.log_lifecycle("vehicle_config_pushed", json!({ "vin": vin })).await;
        info!("Telemetry session established: vehicle pushes to {}", ingress.hostname);

        Ok(TelemetrySession {
            fleet,
            provider,
            audit,
            vin: vin.to_string(),
            state: Some(Established { ingress, prior_hostname }),
        })
    }

    /// Reverse teardown. Idempotent; safe to call more than once.
    pub async fn teardown(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        teardown_steps(
            self.fleet.clone(),
            self.provider.clone(),
            self.audit.clone(),
            self.vin.clone(),
            state,
        )
        .await;
    }
}

async fn teardown_steps(
    fleet: Arc<dyn FleetTransport>,
    provider: Arc<dyn IngressProvider>,
    audit: AuditLog,
    vin: String,
    state: Established,
) {
    if let Err(e) = fleet
        .post(&format!("{}/delete", telemetry_config_path(&vin)), json!({}))
        .await
    {
        warn!("Teardown: could not delete telemetry config: {e}");
    }
    audit.log_lifecycle("vehicle_config_deleted", json!({ "vin": vin })).await;

    if let Some(prior) = &state.prior_hostname {
        if let Err(e) = fleet
            .post("/api/1/partner_accounts/public_key", json!({ "domain": prior }))
            .await
        {
            warn!("Teardown: could not restore partner hostname {prior}: {e}");
        }
        audit.log_lifecycle("partner_restored", json!({ "hostname": prior })).await;
    }

    if let Err(e) = provider.release(&state.ingress).await {
        warn!("Teardown: ingress release failed: {e}");
    }
    audit
        .log_lifecycle("ingress_released", json!({ "hostname": state.ingress.hostname }))
        .await;
    info!("Telemetry session torn down");
}

impl Drop for TelemetrySession {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        warn!("Telemetry session dropped without teardown; running best-effort cleanup");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(teardown_steps(
                self.fleet.clone(),
                self.provider.clone(),
                self.audit.clone(),
                self.vin.clone(),
                state,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NodeError;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    struct RecordingFleet {
        calls: Mutex<Vec<String>>,
        fail_partner: AtomicBool,
        prior_hostname: Option<&'static str>,
    }

    #[async_trait]
    impl FleetTransport for RecordingFleet {
        async fn get(&self, path: &str) -> Result<Value> {
            self.calls.lock().unwrap().push(format!("GET {path}"));
            match self.prior_hostname {
                Some(h) => Ok(json!({ "response": { "config": { "hostname": h } } })),
                None => Ok(json!({ "response": null })),
            }
        }

        async fn post(&self, path: &str, body: Value) -> Result<Value> {
            if path.ends_with("public_key") && self.fail_partner.load(Ordering::SeqCst) {
                self.calls.lock().unwrap().push(format!("POST(fail) {path}"));
                return Err(NodeError::Transport("partner registration down".into()));
            }
            let domain = body
                .pointer("/domain")
                .and_then(Value::as_str)
                .map(|d| format!(" domain={d}"))
                .unwrap_or_default();
            self.calls.lock().unwrap().push(format!("POST {path}{domain}"));
            Ok(json!({ "response": {} }))
        }
    }

    struct CountingIngress {
        allocated: AtomicU64,
        released: AtomicU64,
    }

    #[async_trait]
    impl IngressProvider for CountingIngress {
        async fn allocate(&self, _local_port: u16) -> Result<Ingress> {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            Ok(Ingress { id: "ing-1".into(), hostname: "node.tunnel.example.com".into() })
        }

        async fn release(&self, _ingress: &Ingress) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fixtures(prior: Option<&'static str>) -> (Arc<RecordingFleet>, Arc<CountingIngress>, AuditLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            Arc::new(RecordingFleet {
                calls: Mutex::new(Vec::new()),
                fail_partner: AtomicBool::new(false),
                prior_hostname: prior,
            }),
            Arc::new(CountingIngress { allocated: AtomicU64::new(0), released: AtomicU64::new(0) }),
            AuditLog::new(dir.path().join("audit.jsonl")),
            dir,
        )
    }

    const VIN: &str = "5YJ3E1EA1NF000000";

    #[tokio::test]
    async fn establish_then_teardown_reverses_every_step() {
        let (fleet, ingress, audit, _dir) = fixtures(Some("old.partner.example.com"));
        let mut session = TelemetrySession::establish(
            fleet.clone(),
            ingress.clone(),
            audit,
            VIN,
            4433,
            &[(Field::Soc, 60)],
        )
        .await
        .unwrap();

        session.teardown().await;

        let calls = fleet.calls.lock().unwrap().clone();
        let expect = [
            format!("GET /api/1/vehicles/{VIN}/fleet_telemetry_config"),
            "POST /api/1/partner_accounts/public_key domain=node.tunnel.example.com".to_string(),
            format!("POST /api/1/vehicles/{VIN}/fleet_telemetry_config"),
            format!("POST /api/1/vehicles/{VIN}/fleet_telemetry_config/delete"),
            "POST /api/1/partner_accounts/public_key domain=old.partner.example.com".to_string(),
        ];
        assert_eq!(calls, expect);
        assert_eq!(ingress.released.load(Ordering::SeqCst), 1);

        // Idempotent.
        session.teardown().await;
        assert_eq!(ingress.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_failure_unwinds_the_ingress() {
        let (fleet, ingress, audit, _dir) = fixtures(None);
        fleet.fail_partner.store(true, Ordering::SeqCst);

        let err = TelemetrySession::establish(
            fleet.clone(),
            ingress.clone(),
            audit,
            VIN,
            4433,
            &[],
        )
        .await;
        assert!(err.is_err());
        assert_eq!(ingress.allocated.load(Ordering::SeqCst), 1);
        assert_eq!(ingress.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_guard_runs_teardown() {
        let (fleet, ingress, audit, _dir) = fixtures(None);
        {
            let _session = TelemetrySession::establish(
                fleet.clone(),
                ingress.clone(),
                audit,
                VIN,
                4433,
                &[],
            )
            .await
            .unwrap();
            // Dropped here without teardown().
        }
        // Give the spawned guard a chance to run.
        for _ in 0..50 {
            if ingress.released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(ingress.released.load(Ordering::SeqCst), 1);
        let calls = fleet.calls.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.contains("fleet_telemetry_config/delete")));
    }
}

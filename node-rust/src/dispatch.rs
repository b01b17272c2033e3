//! Inbound RPC dispatch.
//!
//! One entry point for both transports — the gateway's `node.invoke.request`
//! and the local RPC tool surface hand method + params to `dispatch` and get
//! a JSON envelope back (`{ok: true, …}` or `{ok: false, error}`), never an
//! Err.
//!
//! Reads are answered from node-local state: the latest-value store first,
//! then the response cache (filled on miss from the fleet service, which is
//! how a node with no live telemetry still answers). Writes serialize
//! per-VIN and go through the command router, which applies the tier and
//! key-enrollment gates before any network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use vehicle_types::trigger::TriggerRequest;
use vehicle_types::{Field, FieldValue};

use crate::cache::{ResponseCache, TTL_DEFAULT};
use crate::commands::CommandRouter;
use crate::errors::NodeError;
use crate::fleet::{vehicle_data_path, FleetTransport};
use crate::store::LatestStore;
use crate::triggers::TriggerEngine;

// ── Method tables ─────────────────────────────────────────────────────────────

/// Canonical write method → registry command name.
static WRITE_METHODS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("door.lock", "door_lock"),
        ("door.unlock", "door_unlock"),
        ("climate.on", "auto_conditioning_start"),
        ("climate.off", "auto_conditioning_stop"),
        ("climate.temp.set", "set_temps"),
        ("charge.start", "charge_start"),
        ("charge.stop", "charge_stop"),
        ("charge.limit.set", "set_charge_limit"),
        ("charge.amps.set", "set_charging_amps"),
        ("charge.port.open", "charge_port_door_open"),
        ("charge.port.close", "charge_port_door_close"),
        ("trunk.open", "actuate_trunk"),
        ("horn.honk", "honk_horn"),
        ("lights.flash", "flash_lights"),
        ("sentry.on", "set_sentry_mode"),
        ("sentry.off", "set_sentry_mode"),
        ("wake.up", "wake_up"),
    ])
});

/// `system.run` alias table: REST-style command names → canonical methods.
static RUN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("door_lock", "door.lock"),
        ("door_unlock", "door.unlock"),
        ("auto_conditioning_start", "climate.on"),
        ("auto_conditioning_stop", "climate.off"),
        ("set_temps", "climate.temp.set"),
        ("charge_start", "charge.start"),
        ("charge_stop", "charge.stop"),
        ("set_charge_limit", "charge.limit.set"),
        ("set_charging_amps", "charge.amps.set"),
        ("honk_horn", "horn.honk"),
        ("flash_lights", "lights.flash"),
        ("actuate_trunk", "trunk.open"),
        ("wake_up", "wake.up"),
    ])
});

/// Convenience trigger aliases → pre-filled field.
fn trigger_alias_field(method: &str) -> Option<Field> {
    match method {
        "cabin_temp.trigger" => Some(Field::InsideTemp),
        "outside_temp.trigger" => Some(Field::OutsideTemp),
        "battery.trigger" => Some(Field::BatteryLevel),
        "location.trigger" => Some(Field::Location),
        _ => None,
    }
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

fn ok(mut body: Value) -> Value {
    body["ok"] = json!(true);
    body
}

fn err(e: &NodeError) -> Value {
    json!({ "ok": false, "error": { "code": e.code(), "message": e.to_string() } })
}

fn err_parts(code: &str, message: &str) -> Value {
    json!({ "ok": false, "error": { "code": code, "message": message } })
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    vin: String,
    store: LatestStore,
    cache: Arc<ResponseCache>,
    transport: Arc<dyn FleetTransport>,
    router: Arc<CommandRouter>,
    triggers: Arc<TriggerEngine>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        vin: &str,
        store: LatestStore,
        cache: Arc<ResponseCache>,
        transport: Arc<dyn FleetTransport>,
        router: Arc<CommandRouter>,
        triggers: Arc<TriggerEngine>,
    ) -> Self {
        Self {
            vin: vin.to_string(),
            store,
            cache,
            transport,
            router,
            triggers,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Value {
        self.dispatch_at(method, params, 0).await
    }

    async fn dispatch_at(&self, method: &str, params: Value, depth: u8) -> Value {
        debug!("dispatch {method}");
        match method {
            // ── Reads ────────────────────────────────────────────────────
            "location.get" => self.read_location().await,
            "battery.get" => self.read_battery().await,
            "temperature.get" => self.read_temperature().await,
            "speed.get" => self.read_speed().await,
            "charge_state.get" => self.read_charge_state().await,
            "security.get" => self.read_security().await,

            // ── Trigger CRUD ─────────────────────────────────────────────
            "trigger.create" => self.trigger_create(params).await,
            "trigger.delete" => {
                let Some(id) = params["id"].as_str() else {
                    return err_parts("Decode", "trigger.delete requires an id");
                };
                ok(json!({ "deleted": self.triggers.delete(id).await }))
            }
            "trigger.list" => ok(json!({ "triggers": self.triggers.list() })),
            "trigger.poll" => ok(json!({ "notifications": self.triggers.poll() })),

            // ── Meta-dispatch ────────────────────────────────────────────
            "system.run" => {
                if depth >= 1 {
                    return err_parts("Decode", "system.run cannot re-enter itself");
                }
                let Some(target) = params["method"].as_str() else {
                    return err_parts("Decode", "system.run requires a method");
                };
                let resolved = RUN_ALIASES.get(target).copied().unwrap_or(target);
                let inner = params.get("params").cloned().unwrap_or(json!({}));
                Box::pin(self.dispatch_at(resolved, inner, depth + 1)).await
            }

            // ── Trigger aliases & writes ─────────────────────────────────
            other => {
                if let Some(field) = trigger_alias_field(other) {
                    let mut p = params;
                    p["field"] = json!(field.name());
                    return self.trigger_create(p).await;
                }
                if let Some(command) = WRITE_METHODS.get(other).copied() {
                    let p = inject_write_params(other, params);
                    return self.write(command, p).await;
                }
                err_parts("Decode", &format!("unknown method {other}"))
            }
        }
    }

    // ── Write path ────────────────────────────────────────────────────────

    async fn write(&self, command: &str, params: Value) -> Value {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks.entry(self.vin.clone()).or_default().clone()
        };
        let _guard = lock.lock().await;

        match self.router.execute(&self.vin, command, &params).await {
            Ok(resp) => {
                let result = resp
                    .pointer("/response/result")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if result {
                    ok(json!({ "command": command, "result": true }))
                } else {
                    let reason = resp
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .unwrap_or("vehicle refused the command");
                    err_parts("CommandFailed", reason)
                }
            }
            Err(e) => err(&e),
        }
    }

    // ── Read handlers ─────────────────────────────────────────────────────

    async fn read_location(&self) -> Value {
        match self.store.get(Field::Location).await {
            Some((FieldValue::Location(loc), ts)) => ok(json!({
                "available": true,
                "latitude": loc.lat,
                "longitude": loc.lon,
                "heading": loc.heading,
                "speed": loc.speed,
                "timestamp": ts,
            })),
            _ => ok(json!({ "available": false })),
        }
    }

    async fn read_battery(&self) -> Value {
        let Some((_, level, ts)) = self.store.get_any(&[Field::Soc, Field::BatteryLevel]).await
        else {
            return ok(json!({ "available": false }));
        };
        let range = self
            .store
            .get(Field::EstBatteryRange)
            .await
            .and_then(|(v, _)| v.as_f64());
        ok(json!({
            "available": true,
            "battery_level": level.as_f64(),
            "range_miles": range,
            "timestamp": ts,
        }))
    }

    async fn read_temperature(&self) -> Value {
        let inside = self.store.get(Field::InsideTemp).await;
        let outside = self.store.get(Field::OutsideTemp).await;
        if inside.is_none() && outside.is_none() {
            return ok(json!({ "available": false }));
        }
        // Raw Celsius here; Fahrenheit is an event-emitter concern.
        let ts = inside
            .as_ref()
            .map(|(_, t)| *t)
            .max(outside.as_ref().map(|(_, t)| *t));
        ok(json!({
            "available": true,
            "inside_temp_c": inside.and_then(|(v, _)| v.as_f64()),
            "outside_temp_c": outside.and_then(|(v, _)| v.as_f64()),
            "timestamp": ts,
        }))
    }

    async fn read_speed(&self) -> Value {
        match self.store.get(Field::VehicleSpeed).await {
            Some((v, ts)) => ok(json!({
                "available": true,
                "speed_mph": v.as_f64(),
                "timestamp": ts,
            })),
            None => ok(json!({ "available": false })),
        }
    }

    async fn read_charge_state(&self) -> Value {
        if let Some((state, ts)) = self
            .store
            .get_any(&[Field::DetailedChargeState, Field::ChargeState])
            .await
            .map(|(_, v, ts)| (v, ts))
        {
            let level = self
                .store
                .get_any(&[Field::Soc, Field::BatteryLevel])
                .await
                .and_then(|(_, v, _)| v.as_f64());
            let limit = self
                .store
                .get(Field::ChargeLimitSoc)
                .await
                .and_then(|(v, _)| v.as_f64());
            return ok(json!({
                "available": true,
                "charging_state": state.as_text(),
                "battery_level": level,
                "charge_limit_soc": limit,
                "timestamp": ts,
            }));
        }
        // No live telemetry for this section: fall back to the cached REST
        // read, filling it once per TTL window.
        match self.cached_vehicle_data("charge_state").await {
            Ok(section) => ok(json!({ "available": true, "charge_state": section })),
            Err(e) => err(&e),
        }
    }

    async fn read_security(&self) -> Value {
        let locked = self.store.get(Field::Locked).await;
        let sentry = self.store.get(Field::SentryMode).await;
        if locked.is_some() || sentry.is_some() {
            return ok(json!({
                "available": true,
                "locked": locked.and_then(|(v, _)| v.as_bool()),
                "sentry_mode": sentry.and_then(|(v, _)| v.as_bool()),
            }));
        }
        match self.cached_vehicle_data("vehicle_state").await {
            Ok(section) => ok(json!({
                "available": true,
                "locked": section.get("locked").cloned(),
                "sentry_mode": section.get("sentry_mode").cloned(),
            })),
            Err(e) => err(&e),
        }
    }

    async fn cached_vehicle_data(&self, endpoint: &str) -> Result<Value, NodeError> {
        let params = json!({ "endpoints": endpoint });
        if let Some(hit) = self.cache.get("vin", &self.vin, endpoint, &params).await {
            return Ok(hit);
        }
        let resp = self
            .transport
            .get(&vehicle_data_path(&self.vin, endpoint))
            .await?;
        let section = resp
            .pointer(&format!("/response/{endpoint}"))
            .cloned()
            .unwrap_or(Value::Null);
        self.cache
            .put("vin", &self.vin, endpoint, &params, section.clone(), TTL_DEFAULT)
            .await?;
        Ok(section)
    }

    async fn trigger_create(&self, params: Value) -> Value {
        let req: TriggerRequest = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => return err_parts("Decode", &format!("trigger params: {e}")),
        };
        match self.triggers.create(req).await {
            Ok(def) => ok(json!({ "trigger": def })),
            Err(e) => err(&e),
        }
    }
}

/// A few methods carry their argument in the name; make it explicit for the
/// registry's payload.
fn inject_write_params(method: &str, mut params: Value) -> Value {
    match method {
        "sentry.on" => params["on"] = json!(true),
        "sentry.off" => params["on"] = json!(false),
        "trunk.open" => {
            if params.get("which_trunk").is_none() {
                params["which_trunk"] = json!("rear");
            }
        }
        _ => {}
    }
    params
}

//! Command registry and router.
//!
//! A static table maps every command name to its routing domain and whether
//! it must travel the signed path. `wake_up` and the managed-charging
//! endpoints are fleet-broadcast and never signed; everything else is
//! domain-addressed and HMAC-authenticated.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use prost::Message;
use serde_json::Value;
use tracing::debug;

use vehicle_types::wire::{CommandPayload, Domain};

use crate::audit::AuditLog;
use crate::cache::ResponseCache;
use crate::config::Tier;
use crate::errors::{NodeError, Result};
use crate::fleet::{command_path, FleetTransport};
use crate::session::SessionManager;

// ── Command specs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// `None` = fleet broadcast, bypasses the signer entirely.
    pub domain: Option<Domain>,
    pub requires_signing: bool,
}

const fn security(name: &'static str) -> CommandSpec {
    CommandSpec { name, domain: Some(Domain::VehicleSecurity), requires_signing: true }
}

const fn infotainment(name: &'static str) -> CommandSpec {
    CommandSpec { name, domain: Some(Domain::Infotainment), requires_signing: true }
}

const fn broadcast(name: &'static str) -> CommandSpec {
    CommandSpec { name, domain: None, requires_signing: false }
}

const SPECS: &[CommandSpec] = &[
    // Fleet-broadcast, unsigned
    broadcast("wake_up"),
    broadcast("set_managed_charge_current_request"),
    broadcast("set_managed_charger_location"),
    broadcast("set_managed_scheduled_charging_time"),
    // Vehicle security domain
    security("door_lock"),
    security("door_unlock"),
    security("actuate_trunk"),
    security("flash_lights"),
    security("honk_horn"),
    security("remote_start_drive"),
    security("set_sentry_mode"),
    security("speed_limit_activate"),
    security("speed_limit_deactivate"),
    security("speed_limit_set_limit"),
    security("speed_limit_clear_pin"),
    security("set_valet_mode"),
    security("reset_valet_pin"),
    security("set_pin_to_drive"),
    security("reset_pin_to_drive_pin"),
    security("guest_mode"),
    security("window_control"),
    security("sun_roof_control"),
    security("charge_port_door_open"),
    security("charge_port_door_close"),
    security("charge_start"),
    security("charge_stop"),
    security("charge_standard"),
    security("charge_max_range"),
    security("set_charge_limit"),
    security("set_charging_amps"),
    security("set_scheduled_charging"),
    security("set_scheduled_departure"),
    security("add_charge_schedule"),
    security("remove_charge_schedule"),
    security("add_precondition_schedule"),
    security("remove_precondition_schedule"),
    security("set_preconditioning_max"),
    security("trigger_homelink"),
    security("erase_user_data"),
    security("set_vehicle_name"),
    // Infotainment domain
    infotainment("auto_conditioning_start"),
    infotainment("auto_conditioning_stop"),
    infotainment("set_temps"),
    infotainment("set_bioweapon_mode"),
    infotainment("set_cabin_overheat_protection"),
    infotainment("set_climate_keeper_mode"),
    infotainment("set_cop_temp"),
    infotainment("remote_seat_heater_request"),
    infotainment("remote_seat_cooler_request"),
    infotainment("remote_steering_wheel_heater_request"),
    infotainment("remote_steering_wheel_heat_level_request"),
    infotainment("remote_auto_seat_climate_request"),
    infotainment("remote_auto_steering_wheel_heat_climate_request"),
    infotainment("media_toggle_playback"),
    infotainment("media_next_track"),
    infotainment("media_prev_track"),
    infotainment("media_next_fav"),
    infotainment("media_prev_fav"),
    infotainment("media_volume_up"),
    infotainment("media_volume_down"),
    infotainment("adjust_volume"),
    infotainment("navigation_gps_request"),
    infotainment("navigation_request"),
    infotainment("navigation_sc_request"),
    infotainment("navigation_waypoints_request"),
    infotainment("share"),
    infotainment("schedule_software_update"),
    infotainment("cancel_software_update"),
    infotainment("upcoming_calendar_entries"),
    infotainment("remote_boombox"),
    infotainment("dashcam_save_clip"),
    infotainment("set_volume"),
];

static REGISTRY: Lazy<HashMap<&'static str, CommandSpec>> =
    Lazy::new(|| SPECS.iter().map(|s| (s.name, *s)).collect());

pub fn spec(name: &str) -> Option<&'static CommandSpec> {
    REGISTRY.get(name)
}

// ── Policy gate ───────────────────────────────────────────────────────────────

/// Consulted before any network I/O on the write path.
#[derive(Debug, Clone, Copy)]
pub struct PolicyGate {
    pub tier: Tier,
    pub signing_available: bool,
}

impl PolicyGate {
    pub fn check_write(&self, spec: Option<&CommandSpec>) -> Result<()> {
        if self.tier == Tier::ReadOnly {
            return Err(NodeError::TierBlocked);
        }
        if spec.map_or(false, |s| s.requires_signing) && !self.signing_available {
            return Err(NodeError::KeyNotEnrolled);
        }
        Ok(())
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct CommandRouter {
    transport: Arc<dyn FleetTransport>,
    sessions: Option<Arc<SessionManager>>,
    cache: Arc<ResponseCache>,
    audit: AuditLog,
    gate: PolicyGate,
}

impl CommandRouter {
    pub fn new(
        transport: Arc<dyn FleetTransport>,
        sessions: Option<Arc<SessionManager>>,
        cache: Arc<ResponseCache>,
        audit: AuditLog,
        gate: PolicyGate,
    ) -> Self {
        Self { transport, sessions, cache, audit, gate }
    }

    pub fn gate(&self) -> PolicyGate {
        self.gate
    }

    /// Route one write command. Unknown names fall through to the unsigned
    /// REST path and let the fleet service judge them.
    pub async fn execute(&self, vin: &str, name: &str, params: &Value) -> Result<Value> {
        let spec = spec(name);
        self.gate.check_write(spec)?;

        let signed = spec.map_or(false, |s| s.requires_signing);
        let resp = if signed {
            let domain = spec
                .and_then(|s| s.domain)
                .expect("signed commands always carry a domain");
            let sessions = self.sessions.as_ref().ok_or(NodeError::KeyNotEnrolled)?;
            let payload = CommandPayload {
                name: name.to_string(),
                params_json: params.to_string(),
            }
            .encode_to_vec();
            sessions.execute(vin, domain, &payload).await?
        } else {
            debug!("Routing {name} via unsigned command path");
            self.transport.post(&command_path(vin, name), params.clone()).await?
        };

        let ok = resp
            .pointer("/response/result")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.audit.log_command(vin, name, signed, ok).await;
        if ok {
            // Cached reads for this vehicle are stale the moment a write
            // lands.
            self.cache.invalidate("vin", vin).await;
        }
        Ok(resp)
    }
}

//! Telemetry-field → structured-event translation.
//!
//! Fields that survive the dual-gate filter become typed agent events.
//! Temperatures convert to Fahrenheit here, on the outbound side only —
//! read handlers keep returning raw Celsius.

use serde_json::{json, Value};
use vehicle_types::{Field, FieldValue};

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub event_type: &'static str,
    pub data: Value,
}

fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Translate one passing field. Fields without a mapping return `None` and
/// are simply not emitted.
pub fn to_event(field: Field, value: &FieldValue) -> Option<AgentEvent> {
    let ev = match field {
        Field::Location => {
            let loc = value.as_location()?;
            AgentEvent {
                event_type: "location",
                data: json!({
                    "latitude": loc.lat,
                    "longitude": loc.lon,
                    "heading": loc.heading,
                    "speed": loc.speed,
                }),
            }
        }
        Field::Soc | Field::BatteryLevel => AgentEvent {
            event_type: "battery",
            data: json!({ "battery_level": value.as_f64()? }),
        },
        Field::EstBatteryRange => AgentEvent {
            event_type: "battery",
            data: json!({ "range_miles": value.as_f64()? }),
        },
        Field::InsideTemp => AgentEvent {
            event_type: "inside_temp",
            data: json!({ "inside_temp_f": c_to_f(value.as_f64()?) }),
        },
        Field::OutsideTemp => AgentEvent {
            event_type: "outside_temp",
            data: json!({ "outside_temp_f": c_to_f(value.as_f64()?) }),
        },
        Field::VehicleSpeed => AgentEvent {
            event_type: "speed",
            data: json!({ "speed_mph": value.as_f64()? }),
        },
        Field::ChargeState | Field::DetailedChargeState => {
            let state = value.as_text()?;
            AgentEvent {
                event_type: charge_event_type(state),
                data: json!({ "state": state }),
            }
        }
        Field::Locked | Field::SentryMode => AgentEvent {
            event_type: "security_changed",
            data: json!({ "field": field.name(), "value": value }),
        },
        Field::Gear => AgentEvent {
            event_type: "gear_changed",
            data: json!({ "gear": value.as_text()? }),
        },
        _ => return None,
    };
    Some(ev)
}

fn charge_event_type(state: &str) -> &'static str {
    match state {
        "Charging" | "Starting" => "charge_started",
        "Complete" => "charge_complete",
        "Stopped" | "Disconnected" => "charge_stopped",
        _ => "charge_state_changed",
    }
}

//! Telemetry normalization and projection.
//!
//! `normalize` turns a raw wire datum into a registry field + typed value,
//! coercing the loose encodings vehicles actually send (ints for floats,
//! "true"/"false" strings for booleans). Units are passed through untouched
//! — the push stream already carries raw API units.
//!
//! `project` maps a field onto the canonical vehicle-data shape so the cache
//! warmer can keep REST-style reads fresh from the push stream.

use serde_json::{json, Value};
use vehicle_types::wire::{telemetry_value, TelemetryValue};
use vehicle_types::{Field, FieldKind, FieldValue, Location};

#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryMapper;

impl TelemetryMapper {
    /// Normalize one raw datum. Returns `None` for names outside the
    /// registry or values that cannot be coerced to the field's kind.
    pub fn normalize(&self, raw_name: &str, raw: &TelemetryValue) -> Option<(Field, FieldValue)> {
        let field = Field::parse(raw_name)?;
        let value = coerce(field.kind(), raw.value.as_ref()?)?;
        Some((field, value))
    }

    /// `(section, key)` in the vehicle-data shape, for cache warming.
    /// Fields without a REST counterpart return `None`.
    pub fn project(&self, field: Field, value: &FieldValue) -> Option<(&'static str, &'static str, Value)> {
        let scalar = || json_value(value);
        Some(match field {
            Field::Soc => ("charge_state", "usable_battery_level", scalar()),
            Field::BatteryLevel => ("charge_state", "battery_level", scalar()),
            Field::EstBatteryRange => ("charge_state", "est_battery_range", scalar()),
            Field::RatedRange => ("charge_state", "battery_range", scalar()),
            Field::ChargeState => ("charge_state", "charging_state", scalar()),
            Field::DetailedChargeState => ("charge_state", "detailed_charge_state", scalar()),
            Field::ChargeAmps => ("charge_state", "charger_actual_current", scalar()),
            Field::ChargeLimitSoc => ("charge_state", "charge_limit_soc", scalar()),
            Field::TimeToFullCharge => ("charge_state", "time_to_full_charge", scalar()),
            Field::ChargePortDoorOpen => ("charge_state", "charge_port_door_open", scalar()),
            Field::InsideTemp => ("climate_state", "inside_temp", scalar()),
            Field::OutsideTemp => ("climate_state", "outside_temp", scalar()),
            Field::PreconditioningEnabled => ("climate_state", "is_preconditioning", scalar()),
            Field::VehicleSpeed => ("drive_state", "speed", scalar()),
            Field::GpsHeading => ("drive_state", "heading", scalar()),
            Field::Gear => ("drive_state", "shift_state", scalar()),
            Field::Odometer => ("vehicle_state", "odometer", scalar()),
            Field::Locked => ("vehicle_state", "locked", scalar()),
            Field::SentryMode => ("vehicle_state", "sentry_mode", scalar()),
            Field::VehicleName => ("vehicle_state", "vehicle_name", scalar()),
            Field::Location => {
                let loc = value.as_location()?;
                (
                    "drive_state",
                    "location",
                    json!({ "latitude": loc.lat, "longitude": loc.lon }),
                )
            }
            _ => return None,
        })
    }
}

fn json_value(value: &FieldValue) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn coerce(kind: FieldKind, raw: &telemetry_value::Value) -> Option<FieldValue> {
    use telemetry_value::Value as W;
    match (kind, raw) {
        (FieldKind::Float, W::Double(v)) => Some(FieldValue::Float(*v)),
        (FieldKind::Float, W::Int(v)) => Some(FieldValue::Float(*v as f64)),
        (FieldKind::Float, W::Text(s)) => s.parse().ok().map(FieldValue::Float),

        (FieldKind::Int, W::Int(v)) => Some(FieldValue::Int(*v)),
        (FieldKind::Int, W::Double(v)) => Some(FieldValue::Int(*v as i64)),
        (FieldKind::Int, W::Text(s)) => s.parse().ok().map(FieldValue::Int),

        (FieldKind::Bool, W::Flag(b)) => Some(FieldValue::Bool(*b)),
        (FieldKind::Bool, W::Text(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Some(FieldValue::Bool(true)),
            "false" | "0" | "off" => Some(FieldValue::Bool(false)),
            _ => None,
        },
        (FieldKind::Bool, W::Int(v)) => Some(FieldValue::Bool(*v != 0)),

        (FieldKind::Text, W::Text(s)) => Some(FieldValue::Text(s.clone())),
        (FieldKind::Text, W::Double(v)) => Some(FieldValue::Text(v.to_string())),
        (FieldKind::Text, W::Int(v)) => Some(FieldValue::Text(v.to_string())),
        (FieldKind::Text, W::Flag(b)) => Some(FieldValue::Text(b.to_string())),

        (FieldKind::Location, W::Loc(l)) => Some(FieldValue::Location(Location {
            lat: l.lat,
            lon: l.lon,
            heading: l.heading,
            speed: l.speed,
        })),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vehicle_types::wire::LocationValue;

    fn wire(v: telemetry_value::Value) -> TelemetryValue {
        TelemetryValue { value: Some(v) }
    }

    #[test]
    fn normalize_coerces_to_field_kind() {
        let m = TelemetryMapper;
        assert_eq!(
            m.normalize("Soc", &wire(telemetry_value::Value::Int(72))),
            Some((Field::Soc, FieldValue::Float(72.0)))
        );
        assert_eq!(
            m.normalize("Locked", &wire(telemetry_value::Value::Text("true".into()))),
            Some((Field::Locked, FieldValue::Bool(true)))
        );
        assert_eq!(
            m.normalize("Gear", &wire(telemetry_value::Value::Text("D".into()))),
            Some((Field::Gear, FieldValue::Text("D".into())))
        );
        assert!(m
            .normalize("NoSuchField", &wire(telemetry_value::Value::Int(1)))
            .is_none());
    }

    #[test]
    fn normalize_keeps_raw_units() {
        let m = TelemetryMapper;
        // 21.5 °C stays Celsius at this layer.
        assert_eq!(
            m.normalize("InsideTemp", &wire(telemetry_value::Value::Double(21.5))),
            Some((Field::InsideTemp, FieldValue::Float(21.5)))
        );
    }

    #[test]
    fn location_projection() {
        let m = TelemetryMapper;
        let (field, value) = m
            .normalize(
                "Location",
                &wire(telemetry_value::Value::Loc(LocationValue {
                    lat: 37.7749,
                    lon: -122.4194,
                    heading: Some(90.0),
                    speed: None,
                })),
            )
            .unwrap();
        let (section, key, json) = m.project(field, &value).unwrap();
        assert_eq!((section, key), ("drive_state", "location"));
        assert_eq!(json["latitude"], 37.7749);
    }
}

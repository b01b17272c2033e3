//! # vehicle-types
//!
//! Shared telemetry and command types for the Carlink edge node.
//!
//! These types are used by:
//! - `node-rust`: decoding the vehicle push stream, trigger evaluation,
//!   read/write dispatch to agents
//! - `packages/vehicle-simulator`: producing wire-identical frames for
//!   development without a vehicle
//!
//! ## Conventions
//!
//! - Field names match the vehicle push protocol verbatim (`Soc`,
//!   `InsideTemp`, `TpmsPressureFl`, …). Unknown names are dropped at the
//!   decode boundary, never invented.
//! - Values carry **raw API units** (°C, miles, mph). Display conversion is
//!   an outbound concern and never happens in this crate.
//! - Timestamps are unix milliseconds (`i64`) everywhere.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod geo;
pub mod trigger;
pub mod wire;

pub use geo::{haversine_m, LatLon};

// ── Field Registry ────────────────────────────────────────────────────────────

macro_rules! telemetry_fields {
    ($($name:ident),+ $(,)?) => {
        /// A telemetry field name from the vehicle's fixed push registry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Field {
            $($name),+
        }

        impl Field {
            pub const ALL: &'static [Field] = &[$(Field::$name),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $(Field::$name => stringify!($name)),+
                }
            }

            /// Look up a wire field name. Returns `None` for names outside
            /// the registry; callers drop those at the decode boundary.
            pub fn parse(name: &str) -> Option<Field> {
                match name {
                    $(stringify!($name) => Some(Field::$name),)+
                    _ => None,
                }
            }
        }
    };
}

telemetry_fields! {
    // Position & motion
    Location, OriginLocation, DestinationLocation, DestinationName,
    GpsState, GpsHeading, VehicleSpeed, Odometer, Gear,
    BrakePedalPos, PedalPosition, CruiseSetSpeed, CruiseFollowDistance,
    LateralAcceleration, LongitudinalAcceleration,
    DistanceToArrival, MinutesToArrival, RouteTrafficMinutesDelay,
    // Battery & range
    Soc, BatteryLevel, EstBatteryRange, RatedRange, IdealBatteryRange,
    EnergyRemaining, PackVoltage, PackCurrent,
    ModuleTempMin, ModuleTempMax, BatteryHeaterOn,
    // Charging
    ChargeState, DetailedChargeState, ChargeAmps, ChargeCurrentRequest,
    ChargeCurrentRequestMax, ChargeEnableRequest, ChargeLimitSoc,
    ChargePortDoorOpen, ChargePortLatch, ChargePortColdWeatherMode,
    ChargerPhases, ChargerVoltage, ChargingCableType, TimeToFullCharge,
    ScheduledChargingMode, ScheduledChargingPending, ScheduledChargingStartTime,
    ScheduledDepartureTime, AcChargingEnergyIn, AcChargingPower,
    DcChargingEnergyIn, DcChargingPower, EstimatedHoursToChargeTermination,
    FastChargerPresent, FastChargerType,
    // Climate
    InsideTemp, OutsideTemp, HvacPower, HvacAcEnabled, HvacAutoMode,
    HvacFanSpeed, HvacLeftTemperatureRequest, HvacRightTemperatureRequest,
    HvacSteeringWheelHeatLevel, CabinOverheatProtectionMode, ClimateKeeperMode,
    DefrostMode, DefrostForPreconditioning, PreconditioningEnabled,
    SeatHeaterLeft, SeatHeaterRight, SeatHeaterRearLeft, SeatHeaterRearCenter,
    SeatHeaterRearRight, WiperHeatEnabled,
    // Body & security
    Locked, SentryMode, ValetModeEnabled, GuestModeEnabled, PinToDriveEnabled,
    RemoteStartEnabled, ServiceMode, DoorState,
    FdWindow, FpWindow, RdWindow, RpWindow, TrunkFront, TrunkRear,
    HomelinkDeviceCount, HomelinkNearby,
    // Tires
    TpmsPressureFl, TpmsPressureFr, TpmsPressureRl, TpmsPressureRr,
    TpmsHardWarnings, TpmsSoftWarnings,
    // Occupancy & limits
    DriverSeatBelt, PassengerSeatBelt, DriverSeatOccupied,
    SpeedLimitMode, CurrentLimitMph,
    // Identity & software
    Version, CarType, Trim, ExteriorColor, RoofColor, WheelType, VehicleName,
    SoftwareUpdateVersion, SoftwareUpdateDownloadPercentComplete,
    SoftwareUpdateInstallationPercentComplete,
    SoftwareUpdateExpectedDurationMinutes, SoftwareUpdateScheduledStartTime,
}

/// The value shape a field is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float,
    Int,
    Bool,
    Text,
    Location,
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        use Field::*;
        match self {
            Location | OriginLocation | DestinationLocation => FieldKind::Location,

            BatteryHeaterOn | ChargeEnableRequest | ChargePortDoorOpen
            | ChargePortColdWeatherMode | ScheduledChargingPending
            | FastChargerPresent | HvacAcEnabled | HvacAutoMode
            | DefrostForPreconditioning | PreconditioningEnabled
            | WiperHeatEnabled | Locked | SentryMode | ValetModeEnabled
            | GuestModeEnabled | PinToDriveEnabled | RemoteStartEnabled
            | ServiceMode | DriverSeatBelt | PassengerSeatBelt
            | DriverSeatOccupied | SpeedLimitMode | HomelinkNearby => FieldKind::Bool,

            ChargerPhases | HvacFanSpeed | HvacSteeringWheelHeatLevel
            | SeatHeaterLeft | SeatHeaterRight | SeatHeaterRearLeft
            | SeatHeaterRearCenter | SeatHeaterRearRight | TpmsHardWarnings
            | TpmsSoftWarnings | SoftwareUpdateDownloadPercentComplete
            | SoftwareUpdateInstallationPercentComplete
            | SoftwareUpdateExpectedDurationMinutes | RouteTrafficMinutesDelay
            | HomelinkDeviceCount | CruiseFollowDistance => FieldKind::Int,

            Gear | GpsState | ChargeState | DetailedChargeState
            | ChargingCableType | FastChargerType | ScheduledChargingMode
            | ScheduledChargingStartTime | ScheduledDepartureTime
            | ChargePortLatch | ClimateKeeperMode | CabinOverheatProtectionMode
            | DefrostMode | DoorState | DestinationName | Version | CarType
            | Trim | ExteriorColor | RoofColor | WheelType | VehicleName
            | SoftwareUpdateVersion | SoftwareUpdateScheduledStartTime => FieldKind::Text,

            _ => FieldKind::Float,
        }
    }
}

// ── Field Values ──────────────────────────────────────────────────────────────

/// A decoded location fix. Heading and speed ride along when the vehicle
/// reports them in the same datum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl Location {
    pub fn latlon(&self) -> LatLon {
        LatLon { lat: self.lat, lon: self.lon }
    }
}

/// A telemetry field value in raw API units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Location(Location),
}

impl FieldValue {
    /// Numeric view of the value, if one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<&Location> {
        match self {
            FieldValue::Location(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

// ── Telemetry Frame ───────────────────────────────────────────────────────────

/// One decoded push-stream message. Immutable after production; the fanout
/// clones it into every sink queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub vin: String,
    /// Capture time reported by the vehicle, unix milliseconds.
    pub captured_at: i64,
    pub fields: HashMap<Field, FieldValue>,
}

// ── Emission Filter Spec ──────────────────────────────────────────────────────

/// Per-field dual-gate emission rule: a value must move by at least
/// `granularity` (meters for `Location`, raw units otherwise) *and*
/// `throttle` must have elapsed since the last emission.
#[derive(Debug, Clone)]
pub struct FieldFilterSpec {
    pub enabled: bool,
    /// 0.0 means "emit on any change".
    pub granularity: f64,
    pub throttle: Duration,
}

impl FieldFilterSpec {
    pub fn new(granularity: f64, throttle: Duration) -> Self {
        Self { enabled: true, granularity, throttle }
    }

    pub fn disabled() -> Self {
        Self { enabled: false, granularity: 0.0, throttle: Duration::ZERO }
    }
}

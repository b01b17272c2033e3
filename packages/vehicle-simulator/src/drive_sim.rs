//! drive_sim.rs — vehicle state model for the simulator
//!
//! Advances a fake vehicle along a circular test route (or parks it for the
//! charge/sentry scenarios) and renders the changed state as wire datums.
//! Values carry raw API units, matching what a real vehicle pushes: mph,
//! miles, °C, percent.

use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use vehicle_types::wire::{telemetry_value::Value, LocationValue, TelemetryDatum, TelemetryValue};

// ── Config (config.toml) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleSection {
    pub vin: String,
    pub lat: f64,
    pub lon: f64,
    pub battery_pct: f64,
    pub inside_temp_c: f64,
    pub outside_temp_c: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSection {
    pub radius_m: f64,
    pub cruise_speed_mph: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    pub update_rate_hz: f64,
    pub drain_pct_per_mile: f64,
    pub speed_sigma_mph: f64,
    pub temp_sigma_c: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FullConfig {
    pub vehicle: VehicleSection,
    pub route: RouteSection,
    pub simulation: SimulationSection,
}

// ── Scenario ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Cruise the circular route, draining the battery
    Drive,
    /// Parked and charging toward the 90% limit
    Charge,
    /// Parked, locked, sentry mode armed
    Sentry,
}

// ── Simulator ─────────────────────────────────────────────────────────────────

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const CHARGE_LIMIT_PCT: f64 = 90.0;

pub struct VehicleSim {
    cfg: FullConfig,
    scenario: Scenario,
    theta: f64,
    soc: f64,
    odometer_mi: f64,
    inside_temp: f64,
    outside_temp: f64,
    tick_count: u64,
    charging_done: bool,
}

impl VehicleSim {
    pub fn new(cfg: FullConfig, scenario: Scenario) -> Self {
        Self {
            soc: cfg.vehicle.battery_pct,
            inside_temp: cfg.vehicle.inside_temp_c,
            outside_temp: cfg.vehicle.outside_temp_c,
            theta: 0.0,
            odometer_mi: 41_337.0,
            tick_count: 0,
            charging_done: false,
            scenario,
            cfg,
        }
    }

    /// Advance one tick and return the datums that changed.
    pub fn tick(&mut self, dt_secs: f64) -> Vec<TelemetryDatum> {
        self.tick_count += 1;
        let mut rng = rand::thread_rng();
        let temp_noise = Normal::new(0.0, self.cfg.simulation.temp_sigma_c)
            .expect("sigma is non-negative");
        self.inside_temp += temp_noise.sample(&mut rng);
        self.outside_temp += temp_noise.sample(&mut rng);

        let mut data = Vec::new();
        match self.scenario {
            Scenario::Drive => self.tick_drive(dt_secs, &mut data),
            Scenario::Charge => self.tick_charge(&mut data),
            Scenario::Sentry => self.tick_parked(&mut data, true),
        }

        // Slow-moving fields ride along every fifth tick.
        if self.tick_count % 5 == 1 {
            push(&mut data, "Soc", Value::Double(self.soc));
            push(&mut data, "BatteryLevel", Value::Double(self.soc.floor()));
            push(&mut data, "EstBatteryRange", Value::Double(self.soc * 3.1));
            push(&mut data, "InsideTemp", Value::Double(round1(self.inside_temp)));
            push(&mut data, "OutsideTemp", Value::Double(round1(self.outside_temp)));
            push(&mut data, "Odometer", Value::Double(self.odometer_mi));
        }
        data
    }

    fn tick_drive(&mut self, dt_secs: f64, data: &mut Vec<TelemetryDatum>) {
        let mut rng = rand::thread_rng();
        let speed_noise = Normal::new(0.0, self.cfg.simulation.speed_sigma_mph)
            .expect("sigma is non-negative");
        let speed = (self.cfg.route.cruise_speed_mph + speed_noise.sample(&mut rng)).max(0.0);

        let miles = speed * dt_secs / 3600.0;
        self.odometer_mi += miles;
        self.soc = (self.soc - miles * self.cfg.simulation.drain_pct_per_mile).max(0.0);
        self.theta += (miles * 1_609.34) / self.cfg.route.radius_m;

        let (lat, lon) = self.position();
        let heading = (self.theta.to_degrees() + 90.0).rem_euclid(360.0);

        push(
            data,
            "Location",
            Value::Loc(LocationValue {
                lat,
                lon,
                heading: Some(heading),
                speed: Some(speed),
            }),
        );
        push(data, "VehicleSpeed", Value::Double(round1(speed)));
        push(data, "Gear", Value::Text("D".into()));
        if self.tick_count == 1 {
            push(data, "ChargeState", Value::Text("Disconnected".into()));
            push(data, "Locked", Value::Flag(true));
        }
    }

    fn tick_charge(&mut self, data: &mut Vec<TelemetryDatum>) {
        if !self.charging_done {
            self.soc = (self.soc + 0.05).min(CHARGE_LIMIT_PCT);
            if self.soc >= CHARGE_LIMIT_PCT {
                self.charging_done = true;
            }
        }
        let state = if self.charging_done { "Complete" } else { "Charging" };
        self.tick_parked(data, false);
        push(data, "ChargeState", Value::Text(state.into()));
        push(data, "ChargeLimitSoc", Value::Double(CHARGE_LIMIT_PCT));
        push(data, "ChargeAmps", Value::Double(if self.charging_done { 0.0 } else { 32.0 }));
    }

    fn tick_parked(&mut self, data: &mut Vec<TelemetryDatum>, sentry: bool) {
        let (lat, lon) = self.position();
        push(
            data,
            "Location",
            Value::Loc(LocationValue { lat, lon, heading: None, speed: Some(0.0) }),
        );
        push(data, "VehicleSpeed", Value::Double(0.0));
        push(data, "Gear", Value::Text("P".into()));
        push(data, "Locked", Value::Flag(true));
        if sentry {
            push(data, "SentryMode", Value::Flag(true));
        }
    }

    fn position(&self) -> (f64, f64) {
        let r = self.cfg.route.radius_m;
        let lat = self.cfg.vehicle.lat + (r * self.theta.cos()) / METERS_PER_DEG_LAT;
        let lon = self.cfg.vehicle.lon
            + (r * self.theta.sin()) / (METERS_PER_DEG_LAT * self.cfg.vehicle.lat.to_radians().cos());
        (lat, lon)
    }

    pub fn vin(&self) -> &str {
        &self.cfg.vehicle.vin
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn push(data: &mut Vec<TelemetryDatum>, key: &str, value: Value) {
    data.push(TelemetryDatum {
        key: key.to_string(),
        value: Some(TelemetryValue { value: Some(value) }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FullConfig {
        toml::from_str(include_str!("../config.toml")).unwrap()
    }

    #[test]
    fn driving_drains_battery_and_moves() {
        let mut sim = VehicleSim::new(config(), Scenario::Drive);
        let start_soc = sim.soc();
        for _ in 0..600 {
            sim.tick(1.0);
        }
        assert!(sim.soc() < start_soc);
        let (lat, lon) = sim.position();
        assert!((lat - 37.7955).abs() > 1e-5 || (lon + 122.3937).abs() > 1e-5);
    }

    #[test]
    fn charging_reaches_the_limit_and_completes() {
        let mut sim = VehicleSim::new(config(), Scenario::Charge);
        let mut last_state = String::new();
        for _ in 0..400 {
            for d in sim.tick(1.0) {
                if d.key == "ChargeState" {
                    if let Some(TelemetryValue { value: Some(Value::Text(s)) }) = d.value {
                        last_state = s;
                    }
                }
            }
        }
        assert_eq!(last_state, "Complete");
        assert!((sim.soc() - CHARGE_LIMIT_PCT).abs() < 1e-9);
    }

    #[test]
    fn every_tick_reports_position_and_speed() {
        let mut sim = VehicleSim::new(config(), Scenario::Drive);
        let data = sim.tick(1.0);
        let keys: Vec<&str> = data.iter().map(|d| d.key.as_str()).collect();
        assert!(keys.contains(&"Location"));
        assert!(keys.contains(&"VehicleSpeed"));
    }
}

//! Node configuration.
//!
//! Everything is env-var driven (`CARLINK_*`); there is deliberately no CLI
//! surface on the daemon. The interactive setup flow that provisions tokens
//! and keys is a separate tool — this module only reads what it left behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use vehicle_types::{Field, FieldFilterSpec};

// ── Policy tier ───────────────────────────────────────────────────────────────

/// Policy level controlling whether write dispatches are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    ReadOnly,
    Full,
}

impl Tier {
    fn parse(s: &str) -> Option<Tier> {
        match s.trim().to_ascii_lowercase().as_str() {
            "readonly" | "read_only" | "ro" => Some(Tier::ReadOnly),
            "full" | "rw" => Some(Tier::Full),
            _ => None,
        }
    }
}

// ── Node configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// 17-character vehicle identifier. Opaque to the core.
    pub vin: String,
    /// Fleet REST service base URL.
    pub api_base: String,
    /// Local TCP port for the telemetry WebSocket listener.
    pub telemetry_port: u16,
    /// Hex of the vehicle's registered 32-byte Schnorr telemetry key.
    /// Without it the receiver refuses every hello.
    pub vehicle_key_hex: Option<String>,
    /// Agent gateway WebSocket URL. Absent → the gateway client never starts.
    pub gateway_url: Option<String>,
    /// Opaque gateway bearer token, included in the signed connect line.
    pub gateway_token: String,
    /// Client identifier presented to the gateway.
    pub client_id: String,
    pub tier: Tier,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Pre-allocated public HTTPS hostname for the telemetry ingress.
    /// Absent → the tunnel/partner lifecycle is skipped.
    pub public_hostname: Option<String>,
    /// Force the TTY dashboard on/off; `None` = auto-detect.
    pub dashboard: Option<bool>,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl NodeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let vin = env("CARLINK_VIN").context("CARLINK_VIN is required")?;
        if vin.len() != 17 || !vin.bytes().all(|b| b.is_ascii_alphanumeric()) {
            bail!("CARLINK_VIN must be 17 alphanumeric characters, got {vin:?}");
        }

        let config_dir = env("CARLINK_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".carlink")
            });
        let cache_dir = env("CARLINK_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("cache"));

        let tier = match env("CARLINK_TIER") {
            Some(raw) => Tier::parse(&raw)
                .with_context(|| format!("CARLINK_TIER must be readonly|full, got {raw:?}"))?,
            None => Tier::Full,
        };

        let dashboard = env("CARLINK_DASHBOARD").map(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes")
        });

        Ok(Self {
            vin,
            api_base: env("CARLINK_API_BASE")
                .unwrap_or_else(|| "https://fleet-api.example.com".into()),
            telemetry_port: env("CARLINK_TELEMETRY_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4433),
            vehicle_key_hex: env("CARLINK_VEHICLE_KEY"),
            gateway_url: env("CARLINK_GATEWAY_URL"),
            gateway_token: env("CARLINK_GATEWAY_TOKEN").unwrap_or_default(),
            client_id: env("CARLINK_CLIENT_ID").unwrap_or_else(|| "carlink-node".into()),
            tier,
            config_dir,
            cache_dir,
            public_hostname: env("CARLINK_PUBLIC_HOSTNAME"),
            dashboard,
        })
    }

    /// Bearer token for the fleet service: `CARLINK_TOKEN`, falling back to
    /// `{config_dir}/token`. The refresh flow writing that file is a
    /// collaborator.
    pub fn token_file(&self) -> PathBuf {
        self.config_dir.join("token")
    }

    pub fn triggers_file(&self) -> PathBuf {
        self.config_dir.join("triggers.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.config_dir.join("audit.jsonl")
    }

    /// Default per-field emission rules for the structured-event emitter.
    /// Granularity is meters for `Location` and raw API units elsewhere.
    pub fn filter_specs() -> HashMap<Field, FieldFilterSpec> {
        let mut specs = HashMap::new();
        specs.insert(Field::Location, FieldFilterSpec::new(10.0, Duration::from_secs(10)));
        specs.insert(Field::Soc, FieldFilterSpec::new(1.0, Duration::from_secs(60)));
        specs.insert(Field::BatteryLevel, FieldFilterSpec::new(1.0, Duration::from_secs(60)));
        specs.insert(Field::EstBatteryRange, FieldFilterSpec::new(2.0, Duration::from_secs(60)));
        specs.insert(Field::InsideTemp, FieldFilterSpec::new(0.5, Duration::from_secs(120)));
        specs.insert(Field::OutsideTemp, FieldFilterSpec::new(0.5, Duration::from_secs(120)));
        specs.insert(Field::VehicleSpeed, FieldFilterSpec::new(1.0, Duration::from_secs(5)));
        specs.insert(Field::ChargeState, FieldFilterSpec::new(0.0, Duration::ZERO));
        specs.insert(Field::DetailedChargeState, FieldFilterSpec::new(0.0, Duration::ZERO));
        specs.insert(Field::Locked, FieldFilterSpec::new(0.0, Duration::ZERO));
        specs.insert(Field::SentryMode, FieldFilterSpec::new(0.0, Duration::ZERO));
        specs.insert(Field::Gear, FieldFilterSpec::new(0.0, Duration::ZERO));
        specs
    }

    /// Fields + push intervals the lifecycle posts to the vehicle's
    /// telemetry configuration.
    pub fn telemetry_fields() -> Vec<(Field, u32)> {
        vec![
            (Field::Location, 1),
            (Field::VehicleSpeed, 1),
            (Field::Soc, 60),
            (Field::BatteryLevel, 60),
            (Field::EstBatteryRange, 60),
            (Field::InsideTemp, 30),
            (Field::OutsideTemp, 30),
            (Field::ChargeState, 10),
            (Field::DetailedChargeState, 10),
            (Field::Gear, 5),
            (Field::Locked, 10),
            (Field::SentryMode, 10),
            (Field::Odometer, 300),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing() {
        assert_eq!(Tier::parse("readonly"), Some(Tier::ReadOnly));
        assert_eq!(Tier::parse("FULL"), Some(Tier::Full));
        assert_eq!(Tier::parse("supervisor"), None);
    }

    #[test]
    fn filter_specs_cover_event_fields() {
        let specs = NodeConfig::filter_specs();
        assert!(specs[&Field::Location].granularity > 0.0);
        assert_eq!(specs[&Field::Locked].granularity, 0.0);
    }
}

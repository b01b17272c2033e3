//! Trigger definitions and notifications.
//!
//! A trigger is a stored condition over live telemetry. Definitions are
//! created over RPC, evaluated by the node against every decoded frame, and
//! fire notifications through both the pending-poll queue and the gateway
//! push channel.

use serde::{Deserialize, Serialize};

use crate::{Field, FieldValue};

/// Default cooldown between firings of the same trigger.
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOp {
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    Changed,
    Enter,
    Leave,
}

impl TriggerOp {
    pub fn is_geofence(&self) -> bool {
        matches!(self, TriggerOp::Enter | TriggerOp::Leave)
    }
}

/// Circular geofence. `enter`/`leave` fire on boundary crossings only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

/// Trigger threshold: a circle for geofence operators, a scalar otherwise,
/// absent for `changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Geofence(Geofence),
    Number(f64),
    Bool(bool),
    Text(String),
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Server-assigned 12-hex-char id, unique within this node.
    pub id: String,
    pub field: Field,
    pub operator: TriggerOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    #[serde(default)]
    pub once: bool,
    /// Ignored when `once` is set.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    pub created_at: i64,
}

/// Client-supplied shape for `trigger.create`; the node assigns id and
/// creation time.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub field: Field,
    pub operator: TriggerOp,
    #[serde(default, alias = "value")]
    pub threshold: Option<Threshold>,
    #[serde(default)]
    pub once: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerNotification {
    pub trigger_id: String,
    pub field: Field,
    pub operator: TriggerOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    pub value: FieldValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<FieldValue>,
    pub fired_at: i64,
    pub vin: String,
}

//! Trigger engine.
//!
//! Stored conditions over live telemetry. All operations — CRUD over RPC
//! and per-frame evaluation — serialize on one internal mutex; the engine
//! is driven entirely by its callers and owns no tasks.
//!
//! Geofence operators fire on boundary *crossings* only: the first
//! observation seeds the inside/outside state and never fires, wherever it
//! lands. Notifications land in a bounded pending deque (drained by
//! `trigger.poll`) and, when a push sink is registered, are also forwarded
//! to the gateway.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vehicle_types::trigger::{
    Geofence, Threshold, TriggerDefinition, TriggerNotification, TriggerOp, TriggerRequest,
};
use vehicle_types::{haversine_m, Field, FieldKind, FieldValue, LatLon, TelemetryFrame};

use crate::errors::{NodeError, Result};

pub const MAX_TRIGGERS: usize = 100;
pub const PENDING_CAPACITY: usize = 500;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Runtime state ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct TriggerRuntime {
    last_fired_at_ms: Option<i64>,
    previous_value: Option<FieldValue>,
    /// Tri-state for geofences: `None` until the first observation.
    was_inside: Option<bool>,
}

#[derive(Default)]
struct EngineState {
    defs: HashMap<String, TriggerDefinition>,
    runtime: HashMap<String, TriggerRuntime>,
    index: HashMap<Field, Vec<String>>,
    pending: VecDeque<TriggerNotification>,
}

impl EngineState {
    fn insert(&mut self, def: TriggerDefinition) {
        self.index.entry(def.field).or_default().push(def.id.clone());
        self.runtime.insert(def.id.clone(), TriggerRuntime::default());
        self.defs.insert(def.id.clone(), def);
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(def) = self.defs.remove(id) else {
            return false;
        };
        self.runtime.remove(id);
        if let Some(ids) = self.index.get_mut(&def.field) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.index.remove(&def.field);
            }
        }
        true
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct TriggerEngine {
    vin: String,
    state: Mutex<EngineState>,
    push: Mutex<Option<mpsc::Sender<TriggerNotification>>>,
    /// Definitions survive restarts here; runtime state intentionally
    /// does not.
    store_path: Option<PathBuf>,
}

impl TriggerEngine {
    pub fn new(vin: &str, store_path: Option<PathBuf>) -> Self {
        Self {
            vin: vin.to_string(),
            state: Mutex::new(EngineState::default()),
            push: Mutex::new(None),
            store_path,
        }
    }

    /// Register the gateway push channel. Notifications are forwarded
    /// best-effort; a full channel never blocks evaluation.
    pub fn set_push_sink(&self, tx: mpsc::Sender<TriggerNotification>) {
        *self.push.lock().expect("push lock") = Some(tx);
    }

    /// Load persisted definitions. Missing or corrupt files yield an empty
    /// registry, never an error.
    pub async fn load(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(_) => {
                info!("No trigger store at {}, starting empty", path.display());
                return;
            }
        };
        match serde_json::from_str::<Vec<TriggerDefinition>>(&data) {
            Ok(defs) => {
                let mut state = self.state.lock().expect("trigger state lock");
                let count = defs.len();
                for def in defs.into_iter().take(MAX_TRIGGERS) {
                    state.insert(def);
                }
                info!("Loaded {count} persisted triggers");
            }
            Err(e) => warn!("Failed to parse {}: {e}, starting empty", path.display()),
        }
    }

    async fn save(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let defs = self.list();
        let json = match serde_json::to_string_pretty(&defs) {
            Ok(j) => j,
            Err(e) => {
                warn!("Trigger store: serialize failed: {e}");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(path, json).await {
            warn!("Trigger store: write failed: {e}");
        }
    }

    // ── CRUD ──────────────────────────────────────────────────────────────

    pub async fn create(&self, req: TriggerRequest) -> Result<TriggerDefinition> {
        validate(&req)?;
        let def = {
            let mut state = self.state.lock().expect("trigger state lock");
            if state.defs.len() >= MAX_TRIGGERS {
                return Err(NodeError::Decode(format!(
                    "trigger limit reached ({MAX_TRIGGERS})"
                )));
            }
            let mut id = new_id();
            while state.defs.contains_key(&id) {
                id = new_id();
            }
            let def = TriggerDefinition {
                id,
                field: req.field,
                operator: req.operator,
                threshold: req.threshold,
                once: req.once,
                cooldown_ms: req.cooldown_ms,
                created_at: now_ms(),
            };
            state.insert(def.clone());
            def
        };
        self.save().await;
        Ok(def)
    }

    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.state.lock().expect("trigger state lock").remove(id);
        if removed {
            self.save().await;
        }
        removed
    }

    pub fn list(&self) -> Vec<TriggerDefinition> {
        let state = self.state.lock().expect("trigger state lock");
        let mut defs: Vec<_> = state.defs.values().cloned().collect();
        defs.sort_by_key(|d| (d.created_at, d.id.clone()));
        defs
    }

    /// Drain the pending notification deque.
    pub fn poll(&self) -> Vec<TriggerNotification> {
        let mut state = self.state.lock().expect("trigger state lock");
        state.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("trigger state lock").pending.len()
    }

    // ── Evaluation ────────────────────────────────────────────────────────

    pub async fn evaluate(&self, frame: &TelemetryFrame) {
        let now = now_ms();
        let mut fired: Vec<TriggerNotification> = Vec::new();
        let mut removed_once = false;

        {
            let mut guard = self.state.lock().expect("trigger state lock");
            let state = &mut *guard;
            for (field, value) in &frame.fields {
                let Some(ids) = state.index.get(field).cloned() else {
                    continue;
                };
                for id in ids {
                    let Some(def) = state.defs.get(&id).cloned() else {
                        continue;
                    };
                    let runtime = state.runtime.entry(id.clone()).or_default();

                    let hit = condition_holds(&def, value, runtime);
                    let off_cooldown = def.once
                        || runtime
                            .last_fired_at_ms
                            .map_or(true, |t| now - t >= def.cooldown_ms as i64);

                    if hit && off_cooldown {
                        let notification = TriggerNotification {
                            trigger_id: def.id.clone(),
                            field: def.field,
                            operator: def.operator,
                            threshold: def.threshold.clone(),
                            value: value.clone(),
                            previous_value: runtime.previous_value.clone(),
                            fired_at: now,
                            vin: self.vin.clone(),
                        };
                        runtime.last_fired_at_ms = Some(now);
                        runtime.previous_value = Some(value.clone());

                        if state.pending.len() >= PENDING_CAPACITY {
                            state.pending.pop_front();
                        }
                        state.pending.push_back(notification.clone());
                        fired.push(notification);

                        if def.once {
                            state.remove(&id);
                            removed_once = true;
                        }
                        continue;
                    }

                    runtime.previous_value = Some(value.clone());
                }
            }
        }

        if !fired.is_empty() {
            let push = self.push.lock().expect("push lock").clone();
            if let Some(tx) = push {
                for n in &fired {
                    let _ = tx.try_send(n.clone());
                }
            }
        }
        if removed_once {
            self.save().await;
        }
    }
}

fn new_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Condition evaluation ──────────────────────────────────────────────────────

fn condition_holds(
    def: &TriggerDefinition,
    value: &FieldValue,
    runtime: &mut TriggerRuntime,
) -> bool {
    match def.operator {
        TriggerOp::Lt | TriggerOp::Gt | TriggerOp::Lte | TriggerOp::Gte => {
            let (Some(v), Some(Threshold::Number(t))) = (value.as_f64(), def.threshold.as_ref())
            else {
                return false;
            };
            match def.operator {
                TriggerOp::Lt => v < *t,
                TriggerOp::Gt => v > *t,
                TriggerOp::Lte => v <= *t,
                TriggerOp::Gte => v >= *t,
                _ => unreachable!(),
            }
        }
        TriggerOp::Eq | TriggerOp::Neq => {
            let Some(threshold) = def.threshold.as_ref() else {
                return false;
            };
            let equal = threshold_matches(value, threshold);
            if def.operator == TriggerOp::Eq { equal } else { !equal }
        }
        TriggerOp::Changed => runtime
            .previous_value
            .as_ref()
            .map_or(false, |prev| prev != value),
        TriggerOp::Enter | TriggerOp::Leave => {
            let (Some(loc), Some(Threshold::Geofence(fence))) =
                (value.as_location(), def.threshold.as_ref())
            else {
                return false;
            };
            let inside = inside_fence(loc.latlon(), fence);
            let was = runtime.was_inside;
            // State advances on every observation, fire or not.
            runtime.was_inside = Some(inside);
            match def.operator {
                TriggerOp::Enter => was == Some(false) && inside,
                TriggerOp::Leave => was == Some(true) && !inside,
                _ => unreachable!(),
            }
        }
    }
}

fn inside_fence(point: LatLon, fence: &Geofence) -> bool {
    haversine_m(point, LatLon { lat: fence.lat, lon: fence.lon }) <= fence.radius_m
}

/// Structural equality between a live value and a scalar threshold.
fn threshold_matches(value: &FieldValue, threshold: &Threshold) -> bool {
    match threshold {
        Threshold::Number(t) => value.as_f64() == Some(*t),
        Threshold::Bool(t) => value.as_bool() == Some(*t),
        Threshold::Text(t) => value.as_text() == Some(t.as_str()),
        Threshold::Geofence(_) => false,
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

fn validate(req: &TriggerRequest) -> Result<()> {
    match req.operator {
        TriggerOp::Enter | TriggerOp::Leave => {
            if req.field.kind() != FieldKind::Location {
                return Err(NodeError::Decode(format!(
                    "{:?} requires a location field",
                    req.operator
                )));
            }
            match &req.threshold {
                Some(Threshold::Geofence(f)) if f.radius_m > 0.0 => Ok(()),
                _ => Err(NodeError::Decode(
                    "geofence operators require {lat, lon, radius_m}".into(),
                )),
            }
        }
        TriggerOp::Changed => match req.threshold {
            None => Ok(()),
            Some(_) => Err(NodeError::Decode(
                "`changed` takes no threshold value".into(),
            )),
        },
        TriggerOp::Lt | TriggerOp::Gt | TriggerOp::Lte | TriggerOp::Gte => match req.threshold {
            Some(Threshold::Number(_)) => Ok(()),
            _ => Err(NodeError::Decode(
                "comparison operators require a numeric threshold".into(),
            )),
        },
        TriggerOp::Eq | TriggerOp::Neq => match req.threshold {
            Some(Threshold::Geofence(_)) | None => Err(NodeError::Decode(
                "equality operators require a scalar threshold".into(),
            )),
            Some(_) => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vehicle_types::trigger::DEFAULT_COOLDOWN_MS;
    use vehicle_types::Location;

    const VIN: &str = "5YJ3E1EA1NF000000";

    fn frame(fields: Vec<(Field, FieldValue)>) -> TelemetryFrame {
        TelemetryFrame {
            vin: VIN.into(),
            captured_at: now_ms(),
            fields: fields.into_iter().collect(),
        }
    }

    fn soc_frame(level: f64) -> TelemetryFrame {
        frame(vec![(Field::BatteryLevel, FieldValue::Float(level))])
    }

    fn location_frame(lat: f64, lon: f64) -> TelemetryFrame {
        frame(vec![(
            Field::Location,
            FieldValue::Location(Location { lat, lon, heading: None, speed: None }),
        )])
    }

    fn request(field: Field, operator: TriggerOp, threshold: Option<Threshold>) -> TriggerRequest {
        TriggerRequest { field, operator, threshold, once: false, cooldown_ms: DEFAULT_COOLDOWN_MS }
    }

    #[tokio::test]
    async fn low_battery_one_shot() {
        let engine = TriggerEngine::new(VIN, None);
        let def = engine
            .create(TriggerRequest {
                once: true,
                ..request(Field::BatteryLevel, TriggerOp::Lt, Some(Threshold::Number(20.0)))
            })
            .await
            .unwrap();
        assert_eq!(def.id.len(), 12);
        assert!(def.id.chars().all(|c| c.is_ascii_hexdigit()));

        engine.evaluate(&soc_frame(25.0)).await;
        assert!(engine.poll().is_empty());

        engine.evaluate(&soc_frame(18.0)).await;
        let fired = engine.poll();
        assert_eq!(fired.len(), 1);
        let n = &fired[0];
        assert_eq!(n.trigger_id, def.id);
        assert_eq!(n.threshold, Some(Threshold::Number(20.0)));
        assert_eq!(n.value, FieldValue::Float(18.0));
        assert_eq!(n.previous_value, Some(FieldValue::Float(25.0)));
        assert_eq!(n.vin, VIN);

        // One-shot: definition is gone and can never fire again.
        assert!(engine.list().is_empty());
        engine.evaluate(&soc_frame(10.0)).await;
        assert!(engine.poll().is_empty());
    }

    #[tokio::test]
    async fn geofence_leave_fires_only_on_crossing() {
        let engine = TriggerEngine::new(VIN, None);
        engine
            .create(request(
                Field::Location,
                TriggerOp::Leave,
                Some(Threshold::Geofence(Geofence {
                    lat: 37.7749,
                    lon: -122.4194,
                    radius_m: 200.0,
                })),
            ))
            .await
            .unwrap();

        // First observation inside: seeds state, never fires.
        engine.evaluate(&location_frame(37.7749, -122.4194)).await;
        assert!(engine.poll().is_empty());

        // ~567 m north: outside, and we were inside → leave fires.
        engine.evaluate(&location_frame(37.7800, -122.4194)).await;
        let fired = engine.poll();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].operator, TriggerOp::Leave);
    }

    #[tokio::test]
    async fn enter_never_fires_on_first_observation_inside() {
        let engine = TriggerEngine::new(VIN, None);
        engine
            .create(request(
                Field::Location,
                TriggerOp::Enter,
                Some(Threshold::Geofence(Geofence {
                    lat: 37.7749,
                    lon: -122.4194,
                    radius_m: 200.0,
                })),
            ))
            .await
            .unwrap();

        // First observation already inside → no fire.
        engine.evaluate(&location_frame(37.7749, -122.4194)).await;
        assert!(engine.poll().is_empty());
        // Leave, then re-enter → fires exactly once, on the crossing.
        engine.evaluate(&location_frame(37.7800, -122.4194)).await;
        assert!(engine.poll().is_empty());
        engine.evaluate(&location_frame(37.7749, -122.4194)).await;
        assert_eq!(engine.poll().len(), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_refiring() {
        let engine = TriggerEngine::new(VIN, None);
        engine
            .create(request(Field::BatteryLevel, TriggerOp::Lt, Some(Threshold::Number(50.0))))
            .await
            .unwrap();

        engine.evaluate(&soc_frame(40.0)).await;
        engine.evaluate(&soc_frame(39.0)).await;
        engine.evaluate(&soc_frame(38.0)).await;
        assert_eq!(engine.poll().len(), 1, "default 60s cooldown holds");
    }

    #[tokio::test]
    async fn changed_fires_from_second_observation() {
        let engine = TriggerEngine::new(VIN, None);
        engine
            .create(TriggerRequest {
                cooldown_ms: 0,
                ..request(Field::Gear, TriggerOp::Changed, None)
            })
            .await
            .unwrap();

        engine.evaluate(&frame(vec![(Field::Gear, FieldValue::Text("P".into()))])).await;
        assert!(engine.poll().is_empty(), "no previous value yet");
        engine.evaluate(&frame(vec![(Field::Gear, FieldValue::Text("P".into()))])).await;
        assert!(engine.poll().is_empty(), "unchanged");
        engine.evaluate(&frame(vec![(Field::Gear, FieldValue::Text("D".into()))])).await;
        let fired = engine.poll();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].previous_value, Some(FieldValue::Text("P".into())));
    }

    #[tokio::test]
    async fn validation_rules() {
        let engine = TriggerEngine::new(VIN, None);
        // changed must not carry a value.
        assert!(engine
            .create(request(Field::Gear, TriggerOp::Changed, Some(Threshold::Number(1.0))))
            .await
            .is_err());
        // geofence ops need a fence on a location field.
        assert!(engine
            .create(request(Field::Soc, TriggerOp::Enter, Some(Threshold::Number(1.0))))
            .await
            .is_err());
        assert!(engine
            .create(request(Field::Location, TriggerOp::Enter, Some(Threshold::Number(1.0))))
            .await
            .is_err());
        // comparisons need numbers.
        assert!(engine
            .create(request(Field::Soc, TriggerOp::Lt, Some(Threshold::Text("x".into()))))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn duplicate_conditions_coexist_and_fire_independently() {
        let engine = TriggerEngine::new(VIN, None);
        for _ in 0..2 {
            engine
                .create(request(Field::BatteryLevel, TriggerOp::Lt, Some(Threshold::Number(50.0))))
                .await
                .unwrap();
        }
        engine.evaluate(&soc_frame(40.0)).await;
        assert_eq!(engine.poll().len(), 2);
    }

    #[tokio::test]
    async fn max_trigger_limit() {
        let engine = TriggerEngine::new(VIN, None);
        for _ in 0..MAX_TRIGGERS {
            engine
                .create(request(Field::Soc, TriggerOp::Gt, Some(Threshold::Number(1.0))))
                .await
                .unwrap();
        }
        assert!(engine
            .create(request(Field::Soc, TriggerOp::Gt, Some(Threshold::Number(1.0))))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pending_deque_drops_oldest_past_capacity() {
        let engine = TriggerEngine::new(VIN, None);
        engine
            .create(TriggerRequest {
                cooldown_ms: 0,
                ..request(Field::Odometer, TriggerOp::Changed, None)
            })
            .await
            .unwrap();

        for n in 0..(PENDING_CAPACITY + 20) {
            engine
                .evaluate(&frame(vec![(Field::Odometer, FieldValue::Float(n as f64))]))
                .await;
        }
        let fired = engine.poll();
        assert_eq!(fired.len(), PENDING_CAPACITY);
        // Oldest were evicted: the first surviving value is not 1.0 (the
        // first change) but a later one.
        assert!(fired[0].value.as_f64().unwrap() > 1.0);
        assert_eq!(
            fired.last().unwrap().value.as_f64().unwrap(),
            (PENDING_CAPACITY + 19) as f64
        );
    }

    #[tokio::test]
    async fn definitions_persist_across_restart_but_runtime_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");

        let engine = TriggerEngine::new(VIN, Some(path.clone()));
        let def = engine
            .create(request(Field::BatteryLevel, TriggerOp::Lt, Some(Threshold::Number(20.0))))
            .await
            .unwrap();

        let restarted = TriggerEngine::new(VIN, Some(path));
        restarted.load().await;
        let defs = restarted.list();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0], def);
    }

    #[tokio::test]
    async fn push_sink_receives_notifications() {
        let engine = TriggerEngine::new(VIN, None);
        let (tx, mut rx) = mpsc::channel(8);
        engine.set_push_sink(tx);
        engine
            .create(request(Field::BatteryLevel, TriggerOp::Lt, Some(Threshold::Number(50.0))))
            .await
            .unwrap();

        engine.evaluate(&soc_frame(40.0)).await;
        let pushed = rx.try_recv().unwrap();
        assert_eq!(pushed.value, FieldValue::Float(40.0));
        // Dual delivery: the poll queue still has it too.
        assert_eq!(engine.poll().len(), 1);
    }
}

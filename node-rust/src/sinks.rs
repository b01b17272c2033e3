//! Built-in fanout sinks.
//!
//! Each sink is a thin adapter from the frame stream onto one subsystem.
//! Sinks hold no cross-references to each other; the fanout is the only
//! thing that knows the full set.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use vehicle_types::TelemetryFrame;

use crate::cache::ResponseCache;
use crate::emitter::to_event;
use crate::fanout::FrameSink;
use crate::filter::DualGateFilter;
use crate::gateway::GatewayClient;
use crate::mapper::TelemetryMapper;
use crate::store::LatestStore;
use crate::triggers::TriggerEngine;

// ── Latest-value store ────────────────────────────────────────────────────────

pub struct StoreSink {
    pub store: LatestStore,
}

#[async_trait]
impl FrameSink for StoreSink {
    fn name(&self) -> &'static str {
        "latest-store"
    }

    async fn deliver(&self, frame: TelemetryFrame) {
        self.store.merge(&frame).await;
    }
}

// ── Cache warmer ──────────────────────────────────────────────────────────────

/// Projects push updates onto the cached vehicle-data shape so REST-style
/// reads stay warm without fleet round-trips.
pub struct CacheSink {
    pub mapper: TelemetryMapper,
    pub cache: Arc<ResponseCache>,
}

#[async_trait]
impl FrameSink for CacheSink {
    fn name(&self) -> &'static str {
        "cache-warmer"
    }

    async fn deliver(&self, frame: TelemetryFrame) {
        for (field, value) in &frame.fields {
            if let Some((section, key, json)) = self.mapper.project(*field, value) {
                if let Err(e) = self
                    .cache
                    .merge_vehicle_data(&frame.vin, section, key, json)
                    .await
                {
                    debug!("Cache warmer: merge failed for {section}.{key}: {e}");
                }
            }
        }
    }
}

// ── Trigger evaluation ────────────────────────────────────────────────────────

pub struct TriggerSink {
    pub engine: Arc<TriggerEngine>,
}

#[async_trait]
impl FrameSink for TriggerSink {
    fn name(&self) -> &'static str {
        "triggers"
    }

    async fn deliver(&self, frame: TelemetryFrame) {
        self.engine.evaluate(&frame).await;
    }
}

// ── Structured-event emitter ──────────────────────────────────────────────────

/// Dual-gate filter + event translation + gateway push. Only registered
/// when a gateway is configured; filter state starts fresh on reconnect so
/// the agent always gets one full snapshot.
pub struct EmitterSink {
    pub filter: DualGateFilter,
    pub gateway: Arc<GatewayClient>,
}

#[async_trait]
impl FrameSink for EmitterSink {
    fn name(&self) -> &'static str {
        "event-emitter"
    }

    async fn deliver(&self, frame: TelemetryFrame) {
        if !self.gateway.is_connected() {
            return;
        }
        let now = Instant::now();
        for (field, value) in &frame.fields {
            if !self.filter.should_emit(*field, value, now) {
                continue;
            }
            if let Some(event) = to_event(*field, value) {
                let mut data = event.data;
                data["vin"] = json!(frame.vin);
                data["timestamp"] = json!(frame.captured_at);
                self.gateway.notify(event.event_type, data).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use vehicle_types::{Field, FieldValue};

    fn frame(fields: Vec<(Field, FieldValue)>) -> TelemetryFrame {
        TelemetryFrame {
            vin: "5YJ3E1EA1NF000000".into(),
            captured_at: 1_000,
            fields: fields.into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn store_sink_merges() {
        let store = LatestStore::new();
        let sink = StoreSink { store: store.clone() };
        sink.deliver(frame(vec![(Field::Soc, FieldValue::Float(50.0))])).await;
        assert!(store.get(Field::Soc).await.is_some());
    }

    #[tokio::test]
    async fn wire_frame_lands_in_the_store() {
        use crate::codec::decode_frame;
        use crate::mapper::TelemetryMapper;
        use prost::Message as _;
        use vehicle_types::wire::{telemetry_value, TelemetryDatum, TelemetryPayload, TelemetryValue};

        let payload = TelemetryPayload {
            data: vec![TelemetryDatum {
                key: "OutsideTemp".into(),
                value: Some(TelemetryValue {
                    value: Some(telemetry_value::Value::Double(16.5)),
                }),
            }],
            created_at: None,
            vin: "5YJ3E1EA1NF000000".into(),
        };
        let decoded =
            decode_frame(&payload.encode_to_vec(), &TelemetryMapper, "5YJ3E1EA1NF000000").unwrap();

        let store = LatestStore::new();
        StoreSink { store: store.clone() }.deliver(decoded).await;

        let (value, _) = store.get(Field::OutsideTemp).await.unwrap();
        assert_eq!(value, FieldValue::Float(16.5));
    }

    #[tokio::test]
    async fn cache_sink_projects_into_vehicle_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResponseCache::new(dir.path()));
        let sink = CacheSink { mapper: TelemetryMapper, cache: cache.clone() };
        sink.deliver(frame(vec![
            (Field::Soc, FieldValue::Float(64.0)),
            (Field::Locked, FieldValue::Bool(true)),
        ]))
        .await;

        let data = cache
            .get("vin", "5YJ3E1EA1NF000000", "vehicle_data", &Value::Null)
            .await
            .unwrap();
        assert_eq!(data["charge_state"]["usable_battery_level"], 64.0);
        assert_eq!(data["vehicle_state"]["locked"], true);
    }
}

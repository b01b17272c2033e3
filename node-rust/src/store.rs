//! In-memory latest-value store.
//!
//! Written exclusively by the fanout's store sink, read concurrently by the
//! dispatcher. Values always merge (a stale frame still carries the newest
//! observation the node has for a field it hasn't seen recently), but the
//! per-field timestamp never goes backwards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use vehicle_types::{Field, FieldValue, TelemetryFrame};

#[derive(Clone, Default)]
pub struct LatestStore {
    inner: Arc<RwLock<HashMap<Field, (FieldValue, i64)>>>,
}

impl LatestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn merge(&self, frame: &TelemetryFrame) {
        let mut map = self.inner.write().await;
        for (field, value) in &frame.fields {
            let ts = match map.get(field) {
                Some((_, existing_ts)) => frame.captured_at.max(*existing_ts),
                None => frame.captured_at,
            };
            map.insert(*field, (value.clone(), ts));
        }
    }

    pub async fn get(&self, field: Field) -> Option<(FieldValue, i64)> {
        self.inner.read().await.get(&field).cloned()
    }

    /// First present field wins; read handlers use this for aliased fields
    /// (`Soc` vs `BatteryLevel`).
    pub async fn get_any(&self, fields: &[Field]) -> Option<(Field, FieldValue, i64)> {
        let map = self.inner.read().await;
        for f in fields {
            if let Some((v, ts)) = map.get(f) {
                return Some((*f, v.clone(), *ts));
            }
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: i64, fields: Vec<(Field, FieldValue)>) -> TelemetryFrame {
        TelemetryFrame {
            vin: "5YJ3E1EA1NF000000".into(),
            captured_at: ts,
            fields: fields.into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn merge_keeps_latest_and_timestamps_monotonic() {
        let store = LatestStore::new();
        store
            .merge(&frame(1_000, vec![(Field::Soc, FieldValue::Float(80.0))]))
            .await;
        store
            .merge(&frame(2_000, vec![(Field::Soc, FieldValue::Float(79.0))]))
            .await;
        // Stale frame: value still merges, timestamp does not regress.
        store
            .merge(&frame(1_500, vec![(Field::Soc, FieldValue::Float(78.0))]))
            .await;

        let (value, ts) = store.get(Field::Soc).await.unwrap();
        assert_eq!(value, FieldValue::Float(78.0));
        assert_eq!(ts, 2_000);
    }

    #[tokio::test]
    async fn get_any_prefers_first_listed() {
        let store = LatestStore::new();
        store
            .merge(&frame(1, vec![(Field::BatteryLevel, FieldValue::Float(55.0))]))
            .await;
        let (field, value, _) = store
            .get_any(&[Field::Soc, Field::BatteryLevel])
            .await
            .unwrap();
        assert_eq!(field, Field::BatteryLevel);
        assert_eq!(value, FieldValue::Float(55.0));
    }
}

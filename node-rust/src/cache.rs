//! Content-addressed response cache.
//!
//! One file per key under the cache dir, named `{scope}_{identifier}_{digest}`
//! where the digest commits to scope, identifier, endpoint, and the
//! canonicalized request params. Writes are atomic (temp + rename), expiry
//! is checked lazily on read, and any write dispatch against a scope evicts
//! the whole `{scope}_{identifier}_` prefix eagerly.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::errors::Result;

// ── TTL tiers ─────────────────────────────────────────────────────────────────

/// Vehicle identity, option codes, and other near-immutable reads.
pub const TTL_STATIC: Duration = Duration::from_secs(3600);
/// Settings that change on explicit user action.
pub const TTL_SLOW: Duration = Duration::from_secs(300);
pub const TTL_DEFAULT: Duration = Duration::from_secs(60);
/// Fast-moving state (charge power, climate ramp).
pub const TTL_FAST: Duration = Duration::from_secs(30);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Cache entry ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    inserted_at_ms: i64,
    ttl_ms: u64,
    value: Value,
}

// ── Key derivation ────────────────────────────────────────────────────────────

/// Canonical JSON: objects with keys sorted recursively, arrays in place.
fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[*k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn digest(scope: &str, identifier: &str, endpoint: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"|");
    hasher.update(identifier.as_bytes());
    hasher.update(b"|");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(params).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

// ── Cache ─────────────────────────────────────────────────────────────────────

pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn entry_path(&self, scope: &str, identifier: &str, endpoint: &str, params: &Value) -> PathBuf {
        let name = format!("{scope}_{identifier}_{}", digest(scope, identifier, endpoint, params));
        self.dir.join(name)
    }

    /// Read a live entry. Expired files are deleted on the way out.
    pub async fn get(
        &self,
        scope: &str,
        identifier: &str,
        endpoint: &str,
        params: &Value,
    ) -> Option<Value> {
        let path = self.entry_path(scope, identifier, endpoint, params);
        let raw = fs::read(&path).await.ok()?;
        let entry: CacheEntry = serde_json::from_slice(&raw).ok()?;
        if now_ms() - entry.inserted_at_ms >= entry.ttl_ms as i64 {
            let _ = fs::remove_file(&path).await;
            return None;
        }
        Some(entry.value)
    }

    pub async fn put(
        &self,
        scope: &str,
        identifier: &str,
        endpoint: &str,
        params: &Value,
        value: Value,
        ttl: Duration,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let entry = CacheEntry {
            inserted_at_ms: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
            value,
        };
        let path = self.entry_path(scope, identifier, endpoint, params);
        let tmp = path.with_extension(format!("tmp{}", rand::random::<u32>()));
        fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Eagerly drop every entry under `{scope}_{identifier}_`.
    pub async fn invalidate(&self, scope: &str, identifier: &str) {
        let prefix = format!("{scope}_{identifier}_");
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(_) => return,
        };
        let mut dropped = 0usize;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Cache: failed to evict {name}: {e}");
                } else {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!("Cache: invalidated {dropped} entries for {scope}:{identifier}");
        }
    }

    /// Read-modify-write for the telemetry cache warmer: patch one section
    /// key inside the cached vehicle-data shape.
    pub async fn merge_vehicle_data(
        &self,
        vin: &str,
        section: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let params = Value::Null;
        let mut data = self
            .get("vin", vin, "vehicle_data", &params)
            .await
            .unwrap_or_else(|| Value::Object(Default::default()));
        data[section][key] = value;
        self.put("vin", vin, "vehicle_data", &params, data, TTL_DEFAULT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path());
        let params = json!({"endpoints": "charge_state"});
        cache
            .put("vin", "VIN1", "vehicle_data", &params, json!({"soc": 72}), TTL_DEFAULT)
            .await
            .unwrap();
        let got = cache.get("vin", "VIN1", "vehicle_data", &params).await;
        assert_eq!(got, Some(json!({"soc": 72})));
    }

    #[tokio::test]
    async fn expired_entries_are_lazily_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path());
        let params = json!({});
        cache
            .put("vin", "VIN1", "vehicle_data", &params, json!(1), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get("vin", "VIN1", "vehicle_data", &params).await, None);
        // The expired file is gone, not just skipped.
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn invalidate_drops_scope_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path());
        let params = json!({});
        cache.put("vin", "VIN1", "a", &params, json!(1), TTL_DEFAULT).await.unwrap();
        cache.put("vin", "VIN1", "b", &params, json!(2), TTL_DEFAULT).await.unwrap();
        cache.put("vin", "VIN2", "a", &params, json!(3), TTL_DEFAULT).await.unwrap();

        cache.invalidate("vin", "VIN1").await;

        assert_eq!(cache.get("vin", "VIN1", "a", &params).await, None);
        assert_eq!(cache.get("vin", "VIN1", "b", &params).await, None);
        assert_eq!(cache.get("vin", "VIN2", "a", &params).await, Some(json!(3)));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": 1, "y": [2, {"k": 3, "j": 4}]}});
        let b = json!({"a": {"y": [2, {"j": 4, "k": 3}], "z": 1}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn params_order_does_not_change_key() {
        let p1 = json!({"x": 1, "y": 2});
        let p2 = json!({"y": 2, "x": 1});
        assert_eq!(digest("vin", "V", "e", &p1), digest("vin", "V", "e", &p2));
        assert_ne!(digest("vin", "V", "e", &p1), digest("vin", "V", "f", &p1));
    }
}

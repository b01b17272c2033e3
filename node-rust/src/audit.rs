//! SHA-256 chained journal of privileged node events.
//!
//! Signed-command dispatches, trigger firings, session establishment, and
//! lifecycle transitions are appended as blocks where each block hashes the
//! previous block's hash. Tampering with any line breaks the chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ── Event types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Signed command handed to the fleet relay.
    SignedCommand,
    /// Unsigned command posted to the REST command path.
    UnsignedCommand,
    /// Command session established for a (vin, domain) pair.
    SessionEstablished,
    /// A trigger fired a notification.
    TriggerFired,
    /// Tunnel/partner lifecycle step completed or failed.
    LifecycleStep,
    /// Node process start.
    NodeStart,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

// ── Block ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBlock {
    pub block_seq: u64,
    pub timestamp_ms: u64,
    /// Hex SHA-256 of the previous block; genesis uses 64 zeros.
    pub prev_hash: String,
    pub event_type: AuditEventType,
    pub payload_json: String,
    /// SHA-256 of (prev_hash || timestamp_ms || event_type || payload_json).
    pub block_hash: String,
}

impl AuditBlock {
    fn compute_hash(
        prev_hash: &str,
        timestamp_ms: u64,
        event_type: &AuditEventType,
        payload_json: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(event_type.to_string().as_bytes());
        hasher.update(payload_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.prev_hash, self.timestamp_ms, &self.event_type, &self.payload_json)
            == self.block_hash
    }
}

// ── Logger ────────────────────────────────────────────────────────────────────

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Default)]
struct AuditState {
    block_seq: u64,
    last_hash: String,
}

/// Thread-safe, append-only chained logger. Failures are logged but never
/// propagate — an unwritable journal must not block a command.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    state: Arc<RwLock<AuditState>>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Arc::new(RwLock::new(AuditState {
                block_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
        }
    }

    pub async fn append(&self, event_type: AuditEventType, payload: serde_json::Value) {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let block = {
            let mut state = self.state.write().await;
            let payload_json = payload.to_string();
            let block_hash = AuditBlock::compute_hash(
                &state.last_hash,
                timestamp_ms,
                &event_type,
                &payload_json,
            );
            let block = AuditBlock {
                block_seq: state.block_seq,
                timestamp_ms,
                prev_hash: state.last_hash.clone(),
                event_type,
                payload_json,
                block_hash,
            };
            state.last_hash = block.block_hash.clone();
            state.block_seq += 1;
            block
        };

        debug_assert!(block.verify(), "audit block hash mismatch at creation");

        let line = match serde_json::to_string(&block) {
            Ok(l) => format!("{l}\n"),
            Err(e) => {
                warn!("Audit: failed to serialize block: {e}");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match OpenOptions::new().create(true).append(true).open(&self.path).await {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("Audit: write failed: {e}");
                }
            }
            Err(e) => {
                debug!("Audit[{}]: {} — {}", block.block_seq, block.event_type, block.block_hash);
                warn!("Audit: could not open {}: {e}", self.path.display());
            }
        }
    }

    pub async fn log_command(&self, vin: &str, name: &str, signed: bool, ok: bool) {
        let event = if signed {
            AuditEventType::SignedCommand
        } else {
            AuditEventType::UnsignedCommand
        };
        self.append(event, serde_json::json!({ "vin": vin, "command": name, "ok": ok }))
            .await;
    }

    pub async fn log_lifecycle(&self, step: &str, detail: serde_json::Value) {
        self.append(
            AuditEventType::LifecycleStep,
            serde_json::json!({ "step": step, "detail": detail }),
        )
        .await;
    }
}

/// Verify a journal file: every block internally consistent and chained to
/// its predecessor.
pub fn verify_chain(lines: &str) -> bool {
    let mut prev = GENESIS_HASH.to_string();
    for line in lines.lines().filter(|l| !l.trim().is_empty()) {
        let block: AuditBlock = match serde_json::from_str(line) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if block.prev_hash != prev || !block.verify() {
            return false;
        }
        prev = block.block_hash;
    }
    true
}

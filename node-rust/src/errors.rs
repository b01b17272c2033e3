//! Node error taxonomy.
//!
//! Every error surfaced out of the core carries a stable code string; the
//! dispatcher embeds it in RPC error envelopes, and callers branch on it
//! rather than on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Transient I/O against the fleet service or gateway. Retryable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Bearer token expired or rejected. The token source must refresh.
    #[error("fleet auth rejected: {0}")]
    Auth(String),

    /// A write dispatch was refused by the readonly tier.
    #[error("write dispatch blocked: node tier is readonly")]
    TierBlocked,

    /// Command requires signing but no local EC key is enrolled.
    #[error("command requires signing but no key is enrolled")]
    KeyNotEnrolled,

    /// The vehicle rejected a signed command even after one re-handshake.
    #[error("vehicle rejected signed command after retry")]
    SignatureMismatch,

    /// Session-info tag did not verify, or the peer refused the handshake.
    #[error("session handshake failed: {0}")]
    HandshakeFailed(String),

    /// Malformed frame, envelope, or parameter set.
    #[error("decode failure: {0}")]
    Decode(String),

    /// Fleet service throttled the request.
    #[error("fleet service throttled, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The vehicle must be woken before this request can succeed; waking
    /// requires explicit caller consent.
    #[error("vehicle is asleep")]
    VehicleAsleep,
}

impl NodeError {
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Transport(_) => "Transport",
            NodeError::Auth(_) => "Auth",
            NodeError::TierBlocked => "TierBlocked",
            NodeError::KeyNotEnrolled => "KeyNotEnrolled",
            NodeError::SignatureMismatch => "SignatureMismatch",
            NodeError::HandshakeFailed(_) => "HandshakeFailed",
            NodeError::Decode(_) => "Decode",
            NodeError::RateLimited { .. } => "RateLimited",
            NodeError::VehicleAsleep => "VehicleAsleep",
        }
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        NodeError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Transport(e.to_string())
    }
}

impl From<prost::DecodeError> for NodeError {
    fn from(e: prost::DecodeError) -> Self {
        NodeError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

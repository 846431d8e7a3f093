use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("event id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },
    #[error("event pubkey {event} does not match signing key {key}")]
    PubkeyMismatch { event: String, key: String },
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Error types for event-signer.

use std::time::Duration;

use nostr_events::EventError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    /// The raw key is malformed or belongs to a different pubkey.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// Wrong password, or no stored key to decrypt.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("signing failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("extension signer error: {0}")]
    Extension(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SignerError {
    /// Terminal errors are never retried by the pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SignerError::InvalidKey(_)
                | SignerError::InvalidCredential(_)
                | SignerError::RetriesExhausted { .. }
                | SignerError::Config(_)
        )
    }
}

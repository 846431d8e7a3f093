//! Event signing for Nostr clients.
//!
//! [`SigningPipeline`] turns an [`UnsignedEvent`](nostr_events::UnsignedEvent)
//! into a signed one using whatever the caller offers in [`Credentials`]:
//! an [`ExtensionSigner`], a raw secret key, or a password that unlocks the
//! NIP-49 `ncryptsec` held by a [`KeyStore`]. When nothing usable is
//! offered the pipeline answers [`SigningOutcome::NeedsCredential`] instead
//! of failing.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use event_signer::{Credentials, FileKeyStore, SignerConfig, SigningPipeline};
//! use nostr_events::{UnsignedEvent, KIND_TEXT_NOTE};
//!
//! # async fn run() -> Result<(), event_signer::SignerError> {
//! let pipeline = SigningPipeline::new(
//!     SignerConfig::default(),
//!     Arc::new(FileKeyStore::new("nostr.ncryptsec")),
//! );
//! let creds = Credentials::new().with_password("correct horse");
//! let _outcome = pipeline
//!     .sign_event(&creds, UnsignedEvent::new("", KIND_TEXT_NOTE, "gm"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod credentials;
mod error;
mod extension;
mod keystore;
mod pipeline;

pub use config::{
    SignerConfig, DEFAULT_EXTENSION_TIMEOUT_SECS, DEFAULT_KEY_LOG_N, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_DELAY_MS,
};
pub use credentials::{CredentialSource, Credentials};
pub use error::SignerError;
pub use extension::ExtensionSigner;
pub use keystore::{decrypt_secret_key, encrypt_secret_key, FileKeyStore, KeyStore, MemoryKeyStore};
pub use pipeline::{SigningOutcome, SigningPipeline};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! The signing pipeline.
//!
//! Each attempt walks a small state machine:
//!
//! ```text
//! TryExtension ──fail──▶ TryRawKey ──▶ signed
//!      │                     ▲
//!      └──────fail──▶ TryPasswordKey (unlock stored key)
//!                            │
//!        nothing offered ──▶ NeedsCredential
//! ```
//!
//! Terminal errors (bad key, bad credential) end the call at once. Anything
//! else restarts the whole attempt, up to `max_attempts`. An extension
//! failure only falls through when another source was offered; otherwise
//! it counts as a failed attempt.

use std::sync::Arc;

use nostr_events::{EventError, SignedEvent, SigningKey, UnsignedEvent};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::keystore::{decrypt_secret_key, encrypt_secret_key};
use crate::{CredentialSource, Credentials, ExtensionSigner, KeyStore, SignerConfig, SignerError};

/// Result of a signing call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    Signed {
        event: SignedEvent,
        source: CredentialSource,
    },
    /// No credential was offered at all. The caller should ask for one
    /// (typically a password) and call again.
    NeedsCredential,
}

impl SigningOutcome {
    pub fn into_event(self) -> Option<SignedEvent> {
        match self {
            SigningOutcome::Signed { event, .. } => Some(event),
            SigningOutcome::NeedsCredential => None,
        }
    }
}

enum KeyInput {
    Encoded(String),
    Decoded(SigningKey),
}

enum Stage {
    TryExtension(Arc<dyn ExtensionSigner>),
    TryRawKey {
        key: KeyInput,
        source: CredentialSource,
    },
    TryPasswordKey {
        password: String,
    },
    NeedsCredential,
}

pub struct SigningPipeline {
    config: SignerConfig,
    key_store: Arc<dyn KeyStore>,
}

impl SigningPipeline {
    pub fn new(config: SignerConfig, key_store: Arc<dyn KeyStore>) -> Self {
        Self { config, key_store }
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    /// Sign a single prepared event.
    pub async fn sign_event(
        &self,
        credentials: &Credentials,
        event: UnsignedEvent,
    ) -> Result<SigningOutcome, SignerError> {
        self.sign(credentials, move || Ok(event.clone())).await
    }

    /// Sign the event produced by `make_event`, which is called once per
    /// attempt so retries get a fresh `created_at` if the factory sets one.
    pub async fn sign<F>(
        &self,
        credentials: &Credentials,
        mut make_event: F,
    ) -> Result<SigningOutcome, SignerError>
    where
        F: FnMut() -> Result<UnsignedEvent, SignerError> + Send,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = match make_event() {
                Ok(request) => self.run(credentials, request).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Signing attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(SignerError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Encrypt `secret` with `password` and save it in the key store.
    /// Returns the stored `ncryptsec`.
    pub async fn store_secret_key(
        &self,
        secret: &str,
        password: &str,
    ) -> Result<String, SignerError> {
        let secret = secret.to_string();
        let password = password.to_string();
        let log_n = self.config.key_log_n;
        let ncryptsec =
            tokio::task::spawn_blocking(move || encrypt_secret_key(&secret, &password, log_n))
                .await
                .map_err(|e| SignerError::Internal(format!("key encryption task failed: {}", e)))??;

        self.key_store.store_encrypted_key(&ncryptsec).await?;
        info!("Stored encrypted signing key");
        Ok(ncryptsec)
    }

    async fn run(
        &self,
        credentials: &Credentials,
        request: UnsignedEvent,
    ) -> Result<SigningOutcome, SignerError> {
        let mut stage = match &credentials.extension {
            Some(extension) => Stage::TryExtension(extension.clone()),
            None => after_extension(credentials),
        };

        loop {
            stage = match stage {
                Stage::TryExtension(extension) => {
                    match self.try_extension(extension.as_ref(), &request).await {
                        Ok(event) => {
                            info!(event_id = %event.id, "Event signed by extension");
                            return Ok(SigningOutcome::Signed {
                                event,
                                source: CredentialSource::Extension,
                            });
                        }
                        Err(e) => match after_extension(credentials) {
                            // Nothing to fall back to: let the attempt loop retry.
                            Stage::NeedsCredential => return Err(e),
                            next => {
                                warn!(error = %e, "Extension signer failed; falling back");
                                next
                            }
                        },
                    }
                }
                Stage::TryRawKey { key, source } => {
                    let key = match key {
                        KeyInput::Encoded(encoded) => SigningKey::parse(&encoded)
                            .map_err(|e| SignerError::InvalidKey(e.to_string()))?,
                        KeyInput::Decoded(key) => key,
                    };
                    let event = request.sign(&key).map_err(|e| match e {
                        EventError::PubkeyMismatch { .. } => SignerError::InvalidKey(e.to_string()),
                        other => SignerError::Event(other),
                    })?;
                    info!(event_id = %event.id, source = ?source, "Event signed locally");
                    return Ok(SigningOutcome::Signed { event, source });
                }
                Stage::TryPasswordKey { password } => {
                    let key = self.unlock(&password).await?;
                    Stage::TryRawKey {
                        key: KeyInput::Decoded(key),
                        source: CredentialSource::PasswordKey,
                    }
                }
                Stage::NeedsCredential => {
                    debug!("No usable signing credential");
                    return Ok(SigningOutcome::NeedsCredential);
                }
            };
        }
    }

    async fn try_extension(
        &self,
        extension: &dyn ExtensionSigner,
        request: &UnsignedEvent,
    ) -> Result<SignedEvent, SignerError> {
        let limit = self.config.extension_timeout;

        let extension_pubkey = timeout(limit, extension.get_public_key())
            .await
            .map_err(|_| SignerError::Timeout(limit))??
            .to_ascii_lowercase();

        let mut request = request.clone();
        if request.pubkey.is_empty() {
            request.pubkey = extension_pubkey;
        } else if request.pubkey.eq_ignore_ascii_case(&extension_pubkey) {
            request.pubkey = extension_pubkey;
        } else {
            return Err(SignerError::Extension(format!(
                "extension key {} does not match event pubkey {}",
                extension_pubkey, request.pubkey
            )));
        }

        let signed = timeout(limit, extension.sign_event(request.clone()))
            .await
            .map_err(|_| SignerError::Timeout(limit))??;

        signed
            .verify()
            .map_err(|e| SignerError::Extension(format!("extension returned a bad event: {}", e)))?;
        if signed.unsigned() != request {
            return Err(SignerError::Extension(
                "extension signed a different event than requested".to_string(),
            ));
        }
        Ok(signed)
    }

    async fn unlock(&self, password: &str) -> Result<SigningKey, SignerError> {
        let Some(ncryptsec) = self.key_store.load_encrypted_key().await? else {
            return Err(SignerError::InvalidCredential(
                "no stored key to unlock".to_string(),
            ));
        };

        // scrypt is CPU bound.
        let password = password.to_string();
        tokio::task::spawn_blocking(move || decrypt_secret_key(&ncryptsec, &password))
            .await
            .map_err(|e| SignerError::Internal(format!("key decryption task failed: {}", e)))?
    }
}

fn after_extension(credentials: &Credentials) -> Stage {
    if let Some(raw_key) = &credentials.raw_key {
        Stage::TryRawKey {
            key: KeyInput::Encoded(raw_key.clone()),
            source: CredentialSource::RawKey,
        }
    } else if let Some(password) = &credentials.password {
        Stage::TryPasswordKey {
            password: password.clone(),
        }
    } else {
        Stage::NeedsCredential
    }
}

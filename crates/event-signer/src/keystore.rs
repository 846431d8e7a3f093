//! Password-encrypted key storage (NIP-49 `ncryptsec`).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use nostr_events::SigningKey;
use nostr_sdk::nips::nip19::{FromBech32, ToBech32};
use nostr_sdk::nips::nip49::{EncryptedSecretKey, KeySecurity};
use nostr_sdk::SecretKey;
use tracing::debug;

use crate::SignerError;

/// Where the encrypted key lives.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The stored `ncryptsec`, or `None` when nothing is stored.
    async fn load_encrypted_key(&self) -> Result<Option<String>, SignerError>;

    async fn store_encrypted_key(&self, ncryptsec: &str) -> Result<(), SignerError>;
}

/// Key store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(ncryptsec: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(Some(ncryptsec.into())),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load_encrypted_key(&self) -> Result<Option<String>, SignerError> {
        let key = self
            .key
            .lock()
            .map_err(|_| SignerError::KeyStore("key store lock poisoned".to_string()))?;
        Ok(key.clone())
    }

    async fn store_encrypted_key(&self, ncryptsec: &str) -> Result<(), SignerError> {
        let mut key = self
            .key
            .lock()
            .map_err(|_| SignerError::KeyStore("key store lock poisoned".to_string()))?;
        *key = Some(ncryptsec.to_string());
        Ok(())
    }
}

/// Key store backed by a single text file holding the `ncryptsec`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load_encrypted_key(&self) -> Result<Option<String>, SignerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let key = contents.trim();
                Ok((!key.is_empty()).then(|| key.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored key");
                Ok(None)
            }
            Err(e) => Err(SignerError::KeyStore(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn store_encrypted_key(&self, ncryptsec: &str) -> Result<(), SignerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SignerError::KeyStore(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        tokio::fs::write(&self.path, format!("{}\n", ncryptsec))
            .await
            .map_err(|e| {
                SignerError::KeyStore(format!("failed to write {}: {}", self.path.display(), e))
            })
    }
}

/// Encrypt a secret key (hex or `nsec`) with `password` into an `ncryptsec`.
pub fn encrypt_secret_key(secret: &str, password: &str, log_n: u8) -> Result<String, SignerError> {
    let key = SigningKey::parse(secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    let secret_key = SecretKey::from_hex(&key.secret_hex())
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    let encrypted = EncryptedSecretKey::new(&secret_key, password, log_n, KeySecurity::Medium)
        .map_err(|e| SignerError::Internal(format!("key encryption failed: {}", e)))?;
    encrypted
        .to_bech32()
        .map_err(|e| SignerError::Internal(format!("ncryptsec encoding failed: {}", e)))
}

/// Decrypt an `ncryptsec`. Any failure is an invalid credential.
pub fn decrypt_secret_key(ncryptsec: &str, password: &str) -> Result<SigningKey, SignerError> {
    let encrypted = EncryptedSecretKey::from_bech32(ncryptsec.trim()).map_err(|e| {
        SignerError::InvalidCredential(format!("stored key is not a valid ncryptsec: {}", e))
    })?;
    let secret_key = encrypted
        .decrypt(password)
        .map_err(|_| SignerError::InvalidCredential("wrong password".to_string()))?;
    SigningKey::from_hex(&secret_key.to_secret_hex())
        .map_err(|e| SignerError::InvalidCredential(e.to_string()))
}

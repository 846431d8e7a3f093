use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{verify_signature, SigningKey};
use crate::EventError;

pub const KIND_METADATA: u16 = 0;
pub const KIND_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_DELETION: u16 = 5;
pub const KIND_REACTION: u16 = 7;

/// An event before signing.
///
/// `pubkey` may be left empty; signing with a raw key fills it from the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: impl Into<String>, kind: u16, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: unix_timestamp(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// NIP-01 serialization: `[0, pubkey, created_at, kind, tags, content]`.
    pub fn canonical_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(&(
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?)
    }

    pub fn id_digest(&self) -> Result<[u8; 32], EventError> {
        let json = self.canonical_json()?;
        Ok(Sha256::digest(json.as_bytes()).into())
    }

    /// Lowercase hex sha256 of the canonical serialization.
    pub fn compute_id(&self) -> Result<String, EventError> {
        Ok(hex::encode(self.id_digest()?))
    }

    /// Sign locally with a raw key.
    pub fn sign(&self, key: &SigningKey) -> Result<SignedEvent, EventError> {
        let key_pubkey = key.public_key_hex();
        let pubkey = if self.pubkey.is_empty() {
            key_pubkey
        } else if self.pubkey.eq_ignore_ascii_case(&key_pubkey) {
            self.pubkey.to_ascii_lowercase()
        } else {
            return Err(EventError::PubkeyMismatch {
                event: self.pubkey.clone(),
                key: key_pubkey,
            });
        };

        let unsigned = UnsignedEvent {
            pubkey,
            ..self.clone()
        };
        let digest = unsigned.id_digest()?;
        let sig = key.sign_digest(digest);

        Ok(SignedEvent {
            id: hex::encode(digest),
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.serialize()),
        })
    }
}

/// A signed, immutable event as exchanged with relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that `id` is the canonical hash of the other fields.
    pub fn verify_id(&self) -> Result<[u8; 32], EventError> {
        let digest = self.unsigned().id_digest()?;
        let expected = hex::encode(digest);
        if !self.id.eq_ignore_ascii_case(&expected) {
            return Err(EventError::IdMismatch {
                expected,
                actual: self.id.clone(),
            });
        }
        Ok(digest)
    }

    /// Check both the id and the signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let digest = self.verify_id()?;
        verify_signature(&self.pubkey, digest, &self.sig)
    }

    /// Values (index 1) of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

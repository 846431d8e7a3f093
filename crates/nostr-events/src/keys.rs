use std::fmt;

use nostr_sdk::nips::nip19::FromBech32;
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::EventError;

/// A locally held secp256k1 key used to sign events.
///
/// The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct SigningKey {
    keypair: Keypair,
}

impl SigningKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut secp256k1::rand::thread_rng());
        Self { keypair }
    }

    /// Build a key from 32 bytes of lowercase or uppercase hex.
    pub fn from_hex(value: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(value.trim()).map_err(|e| EventError::InvalidHex {
            field: "secret key",
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| EventError::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::new();
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &secret),
        })
    }

    /// Parse a secret key given as hex or as a bech32 `nsec`.
    pub fn parse(value: &str) -> Result<Self, EventError> {
        let value = value.trim();
        if value.starts_with("nsec1") {
            let secret = nostr_sdk::SecretKey::from_bech32(value)
                .map_err(|e| EventError::InvalidKey(e.to_string()))?;
            return Self::from_bytes(&secret.to_secret_bytes());
        }
        Self::from_hex(value)
    }

    /// Hex x-only public key, as carried in an event's `pubkey` field.
    pub fn public_key_hex(&self) -> String {
        let (xonly, _parity) = self.keypair.x_only_public_key();
        hex::encode(xonly.serialize())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub(crate) fn sign_digest(&self, digest: [u8; 32]) -> Signature {
        let secp = Secp256k1::new();
        let message = Message::from_digest(digest);
        secp.sign_schnorr(&message, &self.keypair)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a schnorr signature (hex) over a 32-byte digest for an x-only pubkey (hex).
pub fn verify_signature(pubkey: &str, digest: [u8; 32], sig: &str) -> Result<(), EventError> {
    let pubkey_bytes = hex::decode(pubkey).map_err(|e| EventError::InvalidHex {
        field: "pubkey",
        reason: e.to_string(),
    })?;
    let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;

    let sig_bytes = hex::decode(sig).map_err(|e| EventError::InvalidHex {
        field: "sig",
        reason: e.to_string(),
    })?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(digest);
    secp.verify_schnorr(&signature, &message, &xonly)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))
}

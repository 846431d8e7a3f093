//! Nostr event model shared by the relay pool and the signing pipeline.
//!
//! - [`UnsignedEvent`] / [`SignedEvent`] with the NIP-01 canonical id
//!   (sha256 over `[0, pubkey, created_at, kind, tags, content]`)
//! - [`SigningKey`] for local BIP-340 schnorr signing (hex or `nsec`)
//! - [`Filter`] with local match semantics
//!
//! # Example
//!
//! ```rust
//! use nostr_events::{SigningKey, UnsignedEvent, KIND_TEXT_NOTE};
//!
//! let key = SigningKey::generate();
//! let event = UnsignedEvent::new(key.public_key_hex(), KIND_TEXT_NOTE, "gm")
//!     .sign(&key)
//!     .unwrap();
//! assert!(event.verify().is_ok());
//! ```

mod error;
mod event;
mod filter;
mod keys;

pub use error::EventError;
pub use event::{
    unix_timestamp, SignedEvent, UnsignedEvent, KIND_CONTACTS, KIND_DELETION, KIND_METADATA,
    KIND_REACTION, KIND_TEXT_NOTE,
};
pub use filter::{matches_any, Filter};
pub use keys::{verify_signature, SigningKey};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

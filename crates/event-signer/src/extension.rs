use async_trait::async_trait;
use nostr_events::{SignedEvent, UnsignedEvent};

use crate::SignerError;

/// An external signer that holds the key on the caller's behalf (a browser
/// extension, a remote bunker). The pipeline never trusts its output: the
/// returned event is verified and compared with the request.
#[async_trait]
pub trait ExtensionSigner: Send + Sync {
    /// Hex public key the extension signs with.
    async fn get_public_key(&self) -> Result<String, SignerError>;

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent, SignerError>;
}

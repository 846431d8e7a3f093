use std::env;
use std::fmt;
use std::sync::Arc;

use crate::ExtensionSigner;

/// Which credential produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Extension,
    RawKey,
    /// Stored `ncryptsec` unlocked with a password.
    PasswordKey,
}

/// Everything the caller can offer for signing. Any subset may be empty.
#[derive(Clone, Default)]
pub struct Credentials {
    pub extension: Option<Arc<dyn ExtensionSigner>>,
    /// Hex or `nsec` secret key.
    pub raw_key: Option<String>,
    /// Unlocks the key held by the pipeline's key store.
    pub password: Option<String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `NOSTR_SECRET_KEY` and `NOSTR_KEY_PASSWORD`. Blank values count as
    /// absent.
    pub fn from_env() -> Self {
        Self {
            extension: None,
            raw_key: non_empty_var("NOSTR_SECRET_KEY"),
            password: non_empty_var("NOSTR_KEY_PASSWORD"),
        }
    }

    pub fn with_extension(mut self, extension: Arc<dyn ExtensionSigner>) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn with_raw_key(mut self, key: impl Into<String>) -> Self {
        self.raw_key = Some(key.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.extension.is_none() && self.raw_key.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |present: bool| if present { "<redacted>" } else { "<none>" };
        f.debug_struct("Credentials")
            .field("extension", &self.extension.is_some())
            .field("raw_key", &redact(self.raw_key.is_some()))
            .field("password", &redact(self.password.is_some()))
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new()
            .with_raw_key("deadbeef")
            .with_password("hunter2");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("deadbeef"));
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_is_empty() {
        assert!(Credentials::new().is_empty());
        assert!(!Credentials::new().with_password("pw").is_empty());
    }
}

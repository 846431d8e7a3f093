use std::env;
use std::time::Duration;

use crate::SignerError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 250;
pub const DEFAULT_EXTENSION_TIMEOUT_SECS: u64 = 15;
/// scrypt work factor for newly encrypted keys (2^16 rounds).
pub const DEFAULT_KEY_LOG_N: u8 = 16;

#[derive(Debug, Clone)]
pub struct SignerConfig {
    /// Whole-pipeline attempts before giving up on unexpected errors.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Ceiling for each extension round-trip (public key lookup and sign).
    pub extension_timeout: Duration,
    pub key_log_n: u8,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            extension_timeout: Duration::from_secs(DEFAULT_EXTENSION_TIMEOUT_SECS),
            key_log_n: DEFAULT_KEY_LOG_N,
        }
    }
}

impl SignerConfig {
    pub fn from_env() -> Result<Self, SignerError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("NOSTR_SIGNER_MAX_ATTEMPTS") {
            let attempts: u32 = value
                .trim()
                .parse()
                .map_err(|e| SignerError::Config(format!("NOSTR_SIGNER_MAX_ATTEMPTS: {}", e)))?;
            if attempts == 0 {
                return Err(SignerError::Config(
                    "NOSTR_SIGNER_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.max_attempts = attempts;
        }

        if let Ok(value) = env::var("NOSTR_EXTENSION_TIMEOUT_SECS") {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|e| SignerError::Config(format!("NOSTR_EXTENSION_TIMEOUT_SECS: {}", e)))?;
            config.extension_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

//! Integration tests for the signing pipeline.
//!
//! Run:
//!   cargo test -p event-signer --test pipeline_integration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_signer::{
    encrypt_secret_key, CredentialSource, Credentials, ExtensionSigner, FileKeyStore, KeyStore,
    MemoryKeyStore, SignerConfig, SignerError, SigningOutcome, SigningPipeline,
};
use nostr_events::{SignedEvent, SigningKey, UnsignedEvent, KIND_TEXT_NOTE};

const TEST_LOG_N: u8 = 8;

fn config() -> SignerConfig {
    SignerConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(5),
        extension_timeout: Duration::from_millis(100),
        key_log_n: TEST_LOG_N,
    }
}

fn pipeline(store: impl KeyStore + 'static) -> SigningPipeline {
    SigningPipeline::new(config(), Arc::new(store))
}

fn note(content: &str) -> UnsignedEvent {
    UnsignedEvent::new("", KIND_TEXT_NOTE, content)
}

fn signed(outcome: SigningOutcome) -> (SignedEvent, CredentialSource) {
    match outcome {
        SigningOutcome::Signed { event, source } => (event, source),
        SigningOutcome::NeedsCredential => panic!("expected a signed event"),
    }
}

/// Counts factory invocations.
fn counting_factory(
    calls: Arc<AtomicU32>,
) -> impl FnMut() -> Result<UnsignedEvent, SignerError> + Send {
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(note("counted"))
    }
}

// ============================================================================
// Test doubles
// ============================================================================

enum Behavior {
    Honest,
    Fails,
    Hangs,
    /// Signs different content than requested.
    Tampers,
    /// Returns an event with a broken signature.
    Forges,
}

struct TestExtension {
    key: SigningKey,
    behavior: Behavior,
    pubkey_calls: AtomicU32,
    sign_calls: AtomicU32,
}

impl TestExtension {
    fn new(key: SigningKey, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            key,
            behavior,
            pubkey_calls: AtomicU32::new(0),
            sign_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ExtensionSigner for TestExtension {
    async fn get_public_key(&self) -> Result<String, SignerError> {
        self.pubkey_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Fails => Err(SignerError::Extension("user rejected".to_string())),
            Behavior::Hangs => std::future::pending().await,
            _ => Ok(self.key.public_key_hex()),
        }
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent, SignerError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Honest => Ok(event.sign(&self.key)?),
            Behavior::Tampers => {
                let altered = UnsignedEvent {
                    content: "something else".to_string(),
                    ..event
                };
                Ok(altered.sign(&self.key)?)
            }
            Behavior::Forges => {
                let mut signed = event.sign(&self.key)?;
                signed.sig = "00".repeat(64);
                Ok(signed)
            }
            Behavior::Fails => Err(SignerError::Extension("user rejected".to_string())),
            Behavior::Hangs => std::future::pending().await,
        }
    }
}

/// Fails `failures` loads before answering with `key`.
struct FlakyKeyStore {
    failures: u32,
    loads: AtomicU32,
    key: Option<String>,
}

impl FlakyKeyStore {
    fn new(failures: u32, key: Option<String>) -> Self {
        Self {
            failures,
            loads: AtomicU32::new(0),
            key,
        }
    }
}

#[async_trait]
impl KeyStore for FlakyKeyStore {
    async fn load_encrypted_key(&self) -> Result<Option<String>, SignerError> {
        let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(SignerError::KeyStore(format!("disk hiccup #{}", n)));
        }
        Ok(self.key.clone())
    }

    async fn store_encrypted_key(&self, _ncryptsec: &str) -> Result<(), SignerError> {
        Err(SignerError::KeyStore("read only".to_string()))
    }
}

// ============================================================================
// Extension stage
// ============================================================================

mod extension_tests {
    use super::*;

    #[tokio::test]
    async fn test_extension_signs_first() {
        let key = SigningKey::generate();
        let extension = TestExtension::new(key.clone(), Behavior::Honest);
        let creds = Credentials::new()
            .with_extension(extension.clone())
            .with_raw_key(SigningKey::generate().secret_hex());

        let (event, source) = signed(
            pipeline(MemoryKeyStore::new())
                .sign_event(&creds, note("hi"))
                .await
                .unwrap(),
        );

        assert_eq!(source, CredentialSource::Extension);
        assert_eq!(event.pubkey, key.public_key_hex());
        assert!(event.verify().is_ok());
        assert_eq!(extension.sign_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_extension_falls_back_to_raw_key() {
        let raw = SigningKey::generate();
        let creds = Credentials::new()
            .with_extension(TestExtension::new(SigningKey::generate(), Behavior::Fails))
            .with_raw_key(raw.secret_hex());

        let (event, source) = signed(
            pipeline(MemoryKeyStore::new())
                .sign_event(&creds, note("hi"))
                .await
                .unwrap(),
        );
        assert_eq!(source, CredentialSource::RawKey);
        assert_eq!(event.pubkey, raw.public_key_hex());
    }

    #[tokio::test]
    async fn test_hanging_extension_times_out_and_falls_back() {
        let raw = SigningKey::generate();
        let creds = Credentials::new()
            .with_extension(TestExtension::new(SigningKey::generate(), Behavior::Hangs))
            .with_raw_key(raw.secret_hex());

        let started = std::time::Instant::now();
        let (_, source) = signed(
            pipeline(MemoryKeyStore::new())
                .sign_event(&creds, note("hi"))
                .await
                .unwrap(),
        );
        assert_eq!(source, CredentialSource::RawKey);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tampered_or_forged_results_are_not_accepted() {
        for behavior in [Behavior::Tampers, Behavior::Forges] {
            let raw = SigningKey::generate();
            let creds = Credentials::new()
                .with_extension(TestExtension::new(SigningKey::generate(), behavior))
                .with_raw_key(raw.secret_hex());

            let (event, source) = signed(
                pipeline(MemoryKeyStore::new())
                    .sign_event(&creds, note("hi"))
                    .await
                    .unwrap(),
            );
            assert_eq!(source, CredentialSource::RawKey);
            assert_eq!(event.content, "hi");
        }
    }

    #[tokio::test]
    async fn test_extension_only_failure_is_retried() {
        let extension = TestExtension::new(SigningKey::generate(), Behavior::Fails);
        let creds = Credentials::new().with_extension(extension.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let err = pipeline(MemoryKeyStore::new())
            .sign(&creds, counting_factory(calls.clone()))
            .await
            .unwrap_err();

        match err {
            SignerError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("user rejected"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(extension.pubkey_calls.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hanging_extension_alone_exhausts_retries() {
        let creds = Credentials::new()
            .with_extension(TestExtension::new(SigningKey::generate(), Behavior::Hangs));

        let err = pipeline(MemoryKeyStore::new())
            .sign_event(&creds, note("hi"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SignerError::RetriesExhausted { attempts: 3, ref last_error } if last_error.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn test_extension_with_other_pubkey_is_skipped() {
        let raw = SigningKey::generate();
        let extension = TestExtension::new(SigningKey::generate(), Behavior::Honest);
        let creds = Credentials::new()
            .with_extension(extension.clone())
            .with_raw_key(raw.secret_hex());

        let request = UnsignedEvent::new(raw.public_key_hex(), KIND_TEXT_NOTE, "mine");
        let (event, source) = signed(
            pipeline(MemoryKeyStore::new())
                .sign_event(&creds, request)
                .await
                .unwrap(),
        );
        assert_eq!(source, CredentialSource::RawKey);
        assert_eq!(event.pubkey, raw.public_key_hex());
        assert_eq!(extension.sign_calls.load(Ordering::SeqCst), 0);
    }
}

// ============================================================================
// Raw key stage
// ============================================================================

mod raw_key_tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_offered_needs_credential() {
        let outcome = pipeline(MemoryKeyStore::new())
            .sign_event(&Credentials::new(), note("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, SigningOutcome::NeedsCredential);
    }

    #[tokio::test]
    async fn test_malformed_key_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let creds = Credentials::new().with_raw_key("definitely-not-a-key");

        let err = pipeline(MemoryKeyStore::new())
            .sign(&creds, counting_factory(calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, SignerError::InvalidKey(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pubkey_mismatch_is_invalid_key() {
        let someone_else = SigningKey::generate();
        let creds = Credentials::new().with_raw_key(SigningKey::generate().secret_hex());
        let request = UnsignedEvent::new(someone_else.public_key_hex(), KIND_TEXT_NOTE, "hi");

        let err = pipeline(MemoryKeyStore::new())
            .sign_event(&creds, request)
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::InvalidKey(_)));
    }
}

// ============================================================================
// Password stage
// ============================================================================

mod password_tests {
    use super::*;

    fn stored_key(key: &SigningKey, password: &str) -> String {
        encrypt_secret_key(&key.secret_hex(), password, TEST_LOG_N).unwrap()
    }

    #[tokio::test]
    async fn test_password_unlocks_stored_key() {
        let key = SigningKey::generate();
        let store = MemoryKeyStore::with_key(stored_key(&key, "correct horse"));
        let creds = Credentials::new().with_password("correct horse");

        let (event, source) = signed(
            pipeline(store)
                .sign_event(&creds, note("unlocked"))
                .await
                .unwrap(),
        );
        assert_eq!(source, CredentialSource::PasswordKey);
        assert_eq!(event.pubkey, key.public_key_hex());
        assert!(event.verify().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_is_invalid_credential() {
        let store = MemoryKeyStore::with_key(stored_key(&SigningKey::generate(), "right"));
        let creds = Credentials::new().with_password("wrong");

        let err = pipeline(store)
            .sign_event(&creds, note("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_no_stored_key_is_invalid_credential() {
        let creds = Credentials::new().with_password("pw");
        let err = pipeline(MemoryKeyStore::new())
            .sign_event(&creds, note("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_file_key_store_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::generate();
        let pipeline = pipeline(FileKeyStore::new(dir.path().join("nostr.ncryptsec")));

        pipeline
            .store_secret_key(&key.secret_hex(), "pw")
            .await
            .unwrap();
        let (event, source) = signed(
            pipeline
                .sign_event(&Credentials::new().with_password("pw"), note("from disk"))
                .await
                .unwrap(),
        );
        assert_eq!(source, CredentialSource::PasswordKey);
        assert_eq!(event.pubkey, key.public_key_hex());
    }
}

// ============================================================================
// Retries
// ============================================================================

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_key_store_errors_are_retried() {
        let key = SigningKey::generate();
        let ncryptsec = encrypt_secret_key(&key.secret_hex(), "pw", TEST_LOG_N).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = pipeline(FlakyKeyStore::new(2, Some(ncryptsec)))
            .sign(
                &Credentials::new().with_password("pw"),
                counting_factory(calls.clone()),
            )
            .await
            .unwrap();

        let (event, source) = signed(outcome);
        assert_eq!(source, CredentialSource::PasswordKey);
        assert_eq!(event.pubkey, key.public_key_hex());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_errors_exhaust_retries() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = pipeline(FlakyKeyStore::new(u32::MAX, None))
            .sign(
                &Credentials::new().with_password("pw"),
                counting_factory(calls.clone()),
            )
            .await
            .unwrap_err();

        match err {
            SignerError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("disk hiccup #3"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_factory_errors_count_as_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let key = SigningKey::generate();

        let outcome = pipeline(MemoryKeyStore::new())
            .sign(&Credentials::new().with_raw_key(key.secret_hex()), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Err(SignerError::Internal("clock unavailable".to_string()))
                } else {
                    Ok(note("second try"))
                }
            })
            .await
            .unwrap();

        let (event, _) = signed(outcome);
        assert_eq!(event.content, "second try");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

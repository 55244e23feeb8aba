//! Fakes shared by unit and integration tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::custody::KeyCustodian;
use crate::envelope::metadata::{ALGORITHM, SCHEMA_VERSION};
use crate::envelope::{DataKey, EncryptionMetadata};
use crate::error::{Result, VaultError};
use crate::lock::lock;
use crate::model::format::{ModelFormat, ModelFormatLoader, PlaintextArtifact};
use crate::tee::attestation::{AttestationService, EnvironmentKind, TcbLevel, TCB_LEVEL_CLAIM};

const FAKE_WRAP_PREFIX: &[u8; 4] = b"WRAP";
const FAKE_WRAP_MASK: u8 = 0x5c;

/// A custodian that "wraps" by prefix + XOR and counts every call.
///
/// Unwrap rejects anything without the prefix with a `Crypto` error, the
/// same way a real custodian rejects a tampered wrapped key.
pub struct CountingCustodian {
    key_ref: String,
    fail_wrap: bool,
    wrap_calls: AtomicU32,
    unwrap_calls: AtomicU32,
    /// Delay applied to every unwrap.
    unwrap_delay: Option<Duration>,
}

impl CountingCustodian {
    pub fn new(key_ref: &str) -> Self {
        Self {
            key_ref: key_ref.to_string(),
            fail_wrap: false,
            wrap_calls: AtomicU32::new(0),
            unwrap_calls: AtomicU32::new(0),
            unwrap_delay: None,
        }
    }

    /// Every wrap fails with a custodian-side error.
    pub fn failing_wrap(mut self) -> Self {
        self.fail_wrap = true;
        self
    }

    pub fn with_unwrap_delay(mut self, delay: Duration) -> Self {
        self.unwrap_delay = Some(delay);
        self
    }

    pub fn wrap_calls(&self) -> u32 {
        self.wrap_calls.load(Ordering::SeqCst)
    }

    pub fn unwrap_calls(&self) -> u32 {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    /// Metadata whose wrapped key unwraps to a valid 32-byte data key.
    /// Does not count as a wrap call.
    pub async fn sample_metadata(&self) -> EncryptionMetadata {
        use base64::Engine;
        let key = DataKey::generate();
        EncryptionMetadata {
            schema_version: SCHEMA_VERSION.to_string(),
            algorithm: ALGORITHM.to_string(),
            custodian_key_ref: self.key_ref.clone(),
            encrypted_dek: base64::engine::general_purpose::STANDARD
                .encode(fake_wrap(key.as_bytes())),
            iv: base64::engine::general_purpose::STANDARD.encode([0u8; 16]),
            plaintext_length: 0,
            plaintext_digest: hex::encode([0u8; 32]),
            ciphertext_length: 16,
            artifact_name: "sample.pt".to_string(),
            created_at: None,
        }
    }

    fn check_ref(&self, key_ref: &str) -> Result<()> {
        if key_ref == self.key_ref {
            Ok(())
        } else {
            Err(VaultError::NotFound(format!("custodian key '{key_ref}'")))
        }
    }
}

fn fake_wrap(key: &[u8]) -> Vec<u8> {
    let mut wrapped = FAKE_WRAP_PREFIX.to_vec();
    wrapped.extend(key.iter().map(|b| b ^ FAKE_WRAP_MASK));
    wrapped
}

#[async_trait]
impl KeyCustodian for CountingCustodian {
    async fn wrap(&self, key_ref: &str, key: &[u8]) -> Result<Vec<u8>> {
        self.wrap_calls.fetch_add(1, Ordering::SeqCst);
        self.check_ref(key_ref)?;
        if self.fail_wrap {
            return Err(VaultError::Crypto("wrapping key is disabled".to_string()));
        }
        Ok(fake_wrap(key))
    }

    async fn unwrap(&self, key_ref: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.unwrap_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_ref(key_ref)?;
        let body = wrapped
            .strip_prefix(FAKE_WRAP_PREFIX.as_slice())
            .ok_or_else(|| VaultError::Crypto("wrapped key failed to decrypt".to_string()))?;
        Ok(Zeroizing::new(
            body.iter().map(|b| b ^ FAKE_WRAP_MASK).collect(),
        ))
    }

    fn custodian_name(&self) -> &str {
        "counting"
    }
}

enum Script {
    Trusted(BTreeMap<String, String>),
    InvalidToken,
    Unreachable,
}

/// An attestation service with a fixed answer and call counters.
pub struct ScriptedAttestation {
    script: Script,
    delay: Option<Duration>,
    evidence_calls: AtomicU32,
    verify_calls: AtomicU32,
}

impl ScriptedAttestation {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            evidence_calls: AtomicU32::new(0),
            verify_calls: AtomicU32::new(0),
        }
    }

    /// Verifies every token and answers `claims` plus an up-to-date TCB level.
    pub fn trusted(mut claims: BTreeMap<String, String>) -> Self {
        claims
            .entry(TCB_LEVEL_CLAIM.to_string())
            .or_insert_with(|| TcbLevel::UpToDate.to_string());
        Self::with_script(Script::Trusted(claims))
    }

    /// The verifier answers but refuses every token.
    pub fn invalid_token() -> Self {
        Self::with_script(Script::InvalidToken)
    }

    /// The verifier cannot be reached.
    pub fn unreachable() -> Self {
        Self::with_script(Script::Unreachable)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn evidence_calls(&self) -> u32 {
        self.evidence_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> u32 {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationService for ScriptedAttestation {
    async fn collect_evidence(&self, kind: EnvironmentKind) -> Result<Vec<u8>> {
        self.evidence_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(format!("scripted-quote:{kind}").into_bytes())
    }

    async fn verify_remote(&self, _token: &str) -> Result<BTreeMap<String, String>> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Trusted(claims) => Ok(claims.clone()),
            Script::InvalidToken => Err(VaultError::InvalidToken(
                "signature verification failed".to_string(),
            )),
            Script::Unreachable => Err(VaultError::Transport(
                "attestation service unreachable".to_string(),
            )),
        }
    }

    fn service_name(&self) -> &str {
        "scripted"
    }
}

/// Handle produced by [`RecordingLoader`].
#[derive(Debug, Clone)]
pub struct LoadedBytes {
    pub name: String,
    pub format: ModelFormat,
    pub bytes: Vec<u8>,
}

/// A loader that records the scratch paths it was handed.
pub struct RecordingLoader {
    fail: AtomicBool,
    delay: Option<Duration>,
    load_calls: AtomicU32,
    seen: Mutex<Vec<PathBuf>>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            delay: None,
            load_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every load fails with `Corrupt`.
    pub fn failing() -> Self {
        let loader = Self::new();
        loader.fail.store(true, Ordering::SeqCst);
        loader
    }

    /// Sleep (blocking) inside every load.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn seen_paths(&self) -> Vec<PathBuf> {
        lock(&self.seen).clone()
    }
}

impl Default for RecordingLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFormatLoader for RecordingLoader {
    type Handle = LoadedBytes;

    fn load(&self, format: ModelFormat, artifact: &PlaintextArtifact<'_>) -> Result<LoadedBytes> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(artifact.path.to_path_buf());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(VaultError::Corrupt(format!(
                "{}: loader refused the artifact",
                artifact.name
            )));
        }
        // The scratch copy must match the in-memory plaintext.
        let on_disk = std::fs::read(artifact.path)?;
        if on_disk != artifact.bytes {
            return Err(VaultError::Corrupt(format!(
                "{}: scratch copy differs from plaintext",
                artifact.name
            )));
        }
        Ok(LoadedBytes {
            name: artifact.name.to_string(),
            format,
            bytes: artifact.bytes.to_vec(),
        })
    }
}

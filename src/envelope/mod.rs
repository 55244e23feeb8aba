//! Envelope encryption for model artifacts.
//!
//! Each artifact gets its own 256-bit data key (DEK) and IV. The artifact is
//! encrypted with AES-256-CBC/PKCS#7, the DEK is wrapped by the key
//! custodian, and the wrapped DEK, IV and plaintext digest go into a sidecar
//! [`EncryptionMetadata`] file. Exactly one custodian call is made per
//! encrypt or decrypt regardless of artifact size.

pub mod batch;
pub mod cipher;
pub mod metadata;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use zeroize::Zeroizing;

use crate::custody::KeyCustodian;
use crate::deadline::with_deadline;
use crate::error::{Result, VaultError};
use crate::tee::attestation::AttestationVerdict;
use crate::tee::gate::KeyReleaseGate;

pub use cipher::DataKey;
pub use metadata::{metadata_path_for, EncryptionMetadata};

const DEFAULT_WRAP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EnvelopeCryptoEngine {
    custodian: Arc<dyn KeyCustodian>,
    timeout: Duration,
}

impl std::fmt::Debug for EnvelopeCryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCryptoEngine")
            .field("custodian", &self.custodian.custodian_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn artifact_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

impl EnvelopeCryptoEngine {
    pub fn new(custodian: Arc<dyn KeyCustodian>) -> Self {
        Self {
            custodian,
            timeout: DEFAULT_WRAP_TIMEOUT,
        }
    }

    /// Deadline for the custodian wrap call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Encrypt `plaintext` under a fresh DEK wrapped by `custodian_key_ref`.
    ///
    /// The digest is taken before encryption. A custodian refusal or failure
    /// aborts with no output.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        custodian_key_ref: &str,
        artifact_name: &str,
    ) -> Result<(Vec<u8>, EncryptionMetadata)> {
        let digest = cipher::sha256(plaintext);
        let dek = DataKey::generate();
        let iv = cipher::generate_iv();

        let ciphertext = cipher::encrypt(&dek, &iv, plaintext)?;
        let wrapped = with_deadline(
            self.timeout,
            "custodian wrap",
            self.custodian.wrap(custodian_key_ref, dek.as_bytes()),
        )
        .await
        .map_err(|e| match e {
            VaultError::Transport(_) | VaultError::AccessDenied(_) | VaultError::NotFound(_) => e,
            other => VaultError::Crypto(format!("data key wrap failed: {other}")),
        })?;

        let metadata = EncryptionMetadata {
            schema_version: metadata::SCHEMA_VERSION.to_string(),
            algorithm: metadata::ALGORITHM.to_string(),
            custodian_key_ref: custodian_key_ref.to_string(),
            encrypted_dek: base64::engine::general_purpose::STANDARD.encode(&wrapped),
            iv: base64::engine::general_purpose::STANDARD.encode(iv),
            plaintext_length: plaintext.len() as u64,
            plaintext_digest: hex::encode(digest),
            ciphertext_length: ciphertext.len() as u64,
            artifact_name: artifact_name.to_string(),
            created_at: Some(chrono::Utc::now()),
        };

        tracing::debug!(
            artifact = %artifact_name,
            key_ref = %custodian_key_ref,
            plaintext_bytes = plaintext.len(),
            ciphertext_bytes = ciphertext.len(),
            "Artifact encrypted"
        );
        Ok((ciphertext, metadata))
    }

    /// Decrypt and verify an artifact.
    ///
    /// The DEK is released through `gate`, which refuses unless `verdict` is
    /// trusted. Malformed metadata, a rejected wrapped key, bad padding, a
    /// length mismatch or a digest mismatch are all `Integrity` failures and
    /// no plaintext is returned.
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        metadata: &EncryptionMetadata,
        gate: &KeyReleaseGate,
        verdict: &AttestationVerdict,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let name = metadata.artifact_name.as_str();
        metadata.validate(ciphertext.len())?;
        let iv = metadata.iv_bytes()?;
        let expected_digest = metadata.digest_bytes()?;

        let dek_bytes = gate
            .unwrap_dek(metadata, verdict)
            .await
            .map_err(|e| match e {
                VaultError::Crypto(reason) => {
                    VaultError::integrity(name, format!("wrapped key rejected: {reason}"))
                }
                other => other,
            })?;
        let dek = DataKey::from_slice(&dek_bytes).ok_or_else(|| {
            VaultError::integrity(
                name,
                format!("unwrapped key is {} bytes, expected 32", dek_bytes.len()),
            )
        })?;
        drop(dek_bytes);

        let padded = cipher::decrypt_blocks(&dek, &iv, ciphertext)
            .ok_or_else(|| VaultError::integrity(name, "block decryption failed"))?;
        let plaintext =
            cipher::strip_pkcs7(padded).ok_or_else(|| VaultError::integrity(name, "invalid padding"))?;

        if plaintext.len() as u64 != metadata.plaintext_length {
            return Err(VaultError::integrity(name, "plaintext length mismatch"));
        }
        let actual_digest = cipher::sha256(&plaintext);
        if !cipher::digests_match(&expected_digest, &actual_digest) {
            tracing::warn!(artifact = %name, "Plaintext digest mismatch, artifact rejected");
            return Err(VaultError::integrity(name, "digest mismatch"));
        }

        tracing::debug!(artifact = %name, bytes = plaintext.len(), "Artifact decrypted and verified");
        Ok(plaintext)
    }

    /// Encrypt a file to `output_path` and write the sidecar metadata.
    ///
    /// The metadata goes to `metadata_path`, or `<output>.metadata.json`.
    pub async fn encrypt_file(
        &self,
        model_path: &Path,
        output_path: &Path,
        metadata_path: Option<&Path>,
        custodian_key_ref: &str,
    ) -> Result<EncryptionMetadata> {
        let plaintext = Zeroizing::new(tokio::fs::read(model_path).await?);
        let artifact_name = artifact_name_of(model_path);
        let (ciphertext, metadata) = self
            .encrypt(&plaintext, custodian_key_ref, &artifact_name)
            .await?;

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(output_path, &ciphertext).await?;
        let metadata_path = metadata_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| metadata_path_for(output_path));
        metadata.save(&metadata_path)?;

        tracing::info!(
            artifact = %artifact_name,
            output = %output_path.display(),
            metadata = %metadata_path.display(),
            "Model encrypted"
        );
        Ok(metadata)
    }

    /// Operator-driven decryption of a file to an explicit path.
    ///
    /// The output is created with owner-only permissions and written only
    /// after verification succeeds.
    pub async fn decrypt_file(
        &self,
        encrypted_path: &Path,
        output_path: &Path,
        metadata_path: Option<&Path>,
        gate: &KeyReleaseGate,
        verdict: &AttestationVerdict,
    ) -> Result<EncryptionMetadata> {
        let metadata_path = metadata_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| metadata_path_for(encrypted_path));
        let metadata = EncryptionMetadata::load(&metadata_path)?;
        let ciphertext = tokio::fs::read(encrypted_path).await?;
        let plaintext = self.decrypt(&ciphertext, &metadata, gate, verdict).await?;

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        write_private(output_path, &plaintext)?;
        tracing::info!(
            artifact = %metadata.artifact_name,
            output = %output_path.display(),
            "Model decrypted"
        );
        Ok(metadata)
    }
}

/// Name of the decrypted counterpart of `<name>.encrypted`.
pub fn decrypted_name(encrypted_path: &Path) -> Option<PathBuf> {
    let name = encrypted_path.file_name()?.to_str()?;
    name.strip_suffix(".encrypted").map(PathBuf::from)
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

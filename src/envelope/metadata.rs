use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::cipher::{BLOCK_LEN, IV_LEN};
use crate::error::{Result, VaultError};

pub const SCHEMA_VERSION: &str = "1.0";
pub const ALGORITHM: &str = "AES-256-CBC";

/// Suffix appended to a ciphertext path to locate its metadata.
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Sidecar describing one encrypted artifact.
///
/// The ciphertext file carries no header: the IV and the wrapped data key
/// live only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub schema_version: String,
    pub algorithm: String,
    pub custodian_key_ref: String,
    /// Wrapped data key, base64.
    #[serde(rename = "encryptedDEK", alias = "wrappedDEK")]
    pub encrypted_dek: String,
    /// Base64 IV.
    pub iv: String,
    pub plaintext_length: u64,
    /// Hex SHA-256 of the plaintext.
    pub plaintext_digest: String,
    #[serde(default)]
    pub ciphertext_length: u64,
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `<ciphertext>.metadata.json`
pub fn metadata_path_for(ciphertext_path: &Path) -> PathBuf {
    let mut name = ciphertext_path.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

/// Expected ciphertext length for a PKCS#7-padded plaintext of `plaintext_len` bytes.
///
/// `None` when the padded length does not fit in a `u64`.
pub fn padded_length(plaintext_len: u64) -> Option<u64> {
    (plaintext_len / BLOCK_LEN as u64)
        .checked_add(1)?
        .checked_mul(BLOCK_LEN as u64)
}

impl EncryptionMetadata {
    pub fn wrapped_dek(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.encrypted_dek)
            .map_err(|e| {
                VaultError::integrity(&self.artifact_name, format!("wrapped key is not base64: {e}"))
            })
    }

    pub fn iv_bytes(&self) -> Result<[u8; IV_LEN]> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.iv)
            .map_err(|e| VaultError::integrity(&self.artifact_name, format!("IV is not base64: {e}")))?;
        raw.as_slice().try_into().map_err(|_| {
            VaultError::integrity(
                &self.artifact_name,
                format!("IV must be {IV_LEN} bytes, got {}", raw.len()),
            )
        })
    }

    pub fn digest_bytes(&self) -> Result<[u8; 32]> {
        let raw = hex::decode(&self.plaintext_digest).map_err(|e| {
            VaultError::integrity(&self.artifact_name, format!("digest is not hex: {e}"))
        })?;
        raw.as_slice().try_into().map_err(|_| {
            VaultError::integrity(&self.artifact_name, "digest must be 32 bytes")
        })
    }

    /// Structural checks before any key is requested.
    pub fn validate(&self, ciphertext_len: usize) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(VaultError::integrity(
                &self.artifact_name,
                format!("unsupported schema version '{}'", self.schema_version),
            ));
        }
        if self.algorithm != ALGORITHM {
            return Err(VaultError::integrity(
                &self.artifact_name,
                format!("unsupported algorithm '{}'", self.algorithm),
            ));
        }
        self.iv_bytes()?;
        self.digest_bytes()?;

        let ciphertext_len = ciphertext_len as u64;
        if ciphertext_len == 0 || ciphertext_len % BLOCK_LEN as u64 != 0 {
            return Err(VaultError::integrity(
                &self.artifact_name,
                format!("ciphertext length {ciphertext_len} is not a positive multiple of {BLOCK_LEN}"),
            ));
        }
        let expected = padded_length(self.plaintext_length).ok_or_else(|| {
            VaultError::integrity(&self.artifact_name, "plaintext length out of range")
        })?;
        if ciphertext_len != expected {
            return Err(VaultError::integrity(
                &self.artifact_name,
                format!(
                    "ciphertext length {ciphertext_len} does not match plaintext length {}",
                    self.plaintext_length
                ),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(format!("metadata file {}", path.display()))
            } else {
                VaultError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

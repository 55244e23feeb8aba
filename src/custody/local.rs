use std::path::Path;

use async_trait::async_trait;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use crate::custody::KeyCustodian;
use crate::error::{Result, VaultError};

/// Custodian backed by an RSA private key held in process memory.
///
/// Wraps with RSA-OAEP (SHA-256). Only the key named `key_ref` is known;
/// any other reference is `NotFound`.
pub struct LocalRsaCustodian {
    key_ref: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for LocalRsaCustodian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRsaCustodian")
            .field("key_ref", &self.key_ref)
            .finish_non_exhaustive()
    }
}

impl LocalRsaCustodian {
    pub fn new(key_ref: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            key_ref: key_ref.into(),
            private_key,
            public_key,
        }
    }

    /// Load a PEM private key (PKCS#8 or PKCS#1).
    pub fn from_pem_file(key_ref: impl Into<String>, path: &Path) -> Result<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!("Failed to read key file {}: {e}", path.display()))
        })?);
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| {
                VaultError::Config(format!("Invalid RSA private key {}: {e}", path.display()))
            })?;
        Ok(Self::new(key_ref, private_key))
    }

    /// Generate a fresh key. Intended for tests and local experiments.
    pub fn generate(key_ref: impl Into<String>, bits: usize) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| VaultError::Crypto(format!("RSA key generation failed: {e}")))?;
        Ok(Self::new(key_ref, private_key))
    }

    fn check_ref(&self, key_ref: &str) -> Result<()> {
        if key_ref == self.key_ref {
            Ok(())
        } else {
            Err(VaultError::NotFound(format!(
                "custodian key '{key_ref}' does not exist"
            )))
        }
    }
}

#[async_trait]
impl KeyCustodian for LocalRsaCustodian {
    async fn wrap(&self, key_ref: &str, key: &[u8]) -> Result<Vec<u8>> {
        self.check_ref(key_ref)?;
        let mut rng = rand::rngs::OsRng;
        self.public_key
            .encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), key)
            .map_err(|e| VaultError::Crypto(format!("RSA-OAEP wrap failed: {e}")))
    }

    async fn unwrap(&self, key_ref: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.check_ref(key_ref)?;
        self.private_key
            .decrypt(Oaep::new::<sha2::Sha256>(), wrapped)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::Crypto(format!("RSA-OAEP unwrap failed: {e}")))
    }

    async fn health_check(&self, key_ref: &str) -> Result<()> {
        self.check_ref(key_ref)
    }

    fn custodian_name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    #[tokio::test]
    async fn test_wrap_unwrap_roundtrip() {
        let custodian = LocalRsaCustodian::generate("wrap-key", 2048).unwrap();
        let dek = [0x42u8; 32];
        let wrapped = custodian.wrap("wrap-key", &dek).await.unwrap();
        assert_eq!(wrapped.len(), 256);
        assert_ne!(&wrapped[..32], &dek[..]);

        let unwrapped = custodian.unwrap("wrap-key", &wrapped).await.unwrap();
        assert_eq!(unwrapped.as_slice(), &dek[..]);
    }

    #[tokio::test]
    async fn test_unknown_key_ref_is_not_found() {
        let custodian = LocalRsaCustodian::generate("wrap-key", 2048).unwrap();
        let err = custodian.wrap("other-key", &[0u8; 32]).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        assert!(custodian.health_check("other-key").await.is_err());
        assert!(custodian.health_check("wrap-key").await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_wrapped_key_fails() {
        let custodian = LocalRsaCustodian::generate("wrap-key", 2048).unwrap();
        let mut wrapped = custodian.wrap("wrap-key", &[7u8; 32]).await.unwrap();
        wrapped[10] ^= 0x01;
        let err = custodian.unwrap("wrap-key", &wrapped).await.unwrap_err();
        assert!(matches!(err, VaultError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_from_pem_file() {
        let dir = tempfile::tempdir().unwrap();
        let generated = LocalRsaCustodian::generate("k", 2048).unwrap();
        let pem = generated
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap();
        let path = dir.path().join("wrap.pem");
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let loaded = LocalRsaCustodian::from_pem_file("k", &path).unwrap();
        let wrapped = generated.wrap("k", &[1u8; 32]).await.unwrap();
        let unwrapped = loaded.unwrap("k", &wrapped).await.unwrap();
        assert_eq!(unwrapped.as_slice(), &[1u8; 32]);
    }

    #[test]
    fn test_from_pem_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrap.pem");
        std::fs::write(&path, "-----BEGIN NOTHING-----").unwrap();
        let err = LocalRsaCustodian::from_pem_file("k", &path).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}

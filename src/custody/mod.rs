//! Key custodian adapters.
//!
//! The custodian holds the long-lived wrapping key. The vault only ever asks
//! it to wrap a freshly generated data key and, after a trusted attestation
//! verdict, to unwrap one.

pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::config::{CustodianConfig, CustodianKind};
use crate::error::{Result, VaultError};

/// Wrapping algorithm used with every custodian.
pub const WRAP_ALGORITHM: &str = "RSA-OAEP-256";

/// External key custodian.
///
/// This is an extension point for HSM and cloud key vault integration.
/// Failures are `AccessDenied`, `NotFound` or `Transport`.
#[async_trait]
pub trait KeyCustodian: Send + Sync {
    /// Wrap a data key under the custodian key `key_ref`.
    async fn wrap(&self, key_ref: &str, key: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap a data key previously wrapped under `key_ref`.
    async fn unwrap(&self, key_ref: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Check that the custodian is reachable and `key_ref` is usable.
    ///
    /// Default: always healthy.
    async fn health_check(&self, key_ref: &str) -> Result<()> {
        let _ = key_ref;
        Ok(())
    }

    /// Custodian name for audit logging and diagnostics.
    fn custodian_name(&self) -> &str;
}

/// Build the configured custodian.
///
/// Returns `None` when no custodian is configured.
pub fn from_config(config: &CustodianConfig) -> Result<Option<Arc<dyn KeyCustodian>>> {
    match config.kind {
        CustodianKind::None => Ok(None),
        CustodianKind::Local => {
            let path = config.key_path.as_ref().ok_or_else(|| {
                VaultError::Config("local custodian requires custodian.key_path".to_string())
            })?;
            let custodian = local::LocalRsaCustodian::from_pem_file(&config.key_ref, path)?;
            tracing::info!(
                key_ref = %config.key_ref,
                path = %path.display(),
                "Using local RSA key custodian"
            );
            Ok(Some(Arc::new(custodian)))
        }
        CustodianKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                VaultError::Config("http custodian requires custodian.url".to_string())
            })?;
            let custodian = remote::HttpKeyCustodian::new(
                url,
                config.access_token.clone(),
                std::time::Duration::from_secs(config.timeout_secs),
            )?;
            tracing::info!(url, key_ref = %config.key_ref, "Using remote key custodian");
            Ok(Some(Arc::new(custodian)))
        }
    }
}

//! Batch encryption and decryption with per-item failure isolation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::envelope::{decrypted_name, EnvelopeCryptoEngine};
use crate::error::{Result, VaultError};
use crate::tee::attestation::AttestationVerdict;
use crate::tee::gate::KeyReleaseGate;

/// Default pattern for batch encryption.
pub const DEFAULT_ENCRYPT_PATTERN: &str = "*.pt";
/// Suffix of encrypted artifacts.
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub file: String,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a batch run. One item's failure never stops the others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub details: Vec<BatchItem>,
}

impl BatchSummary {
    pub fn record_success(&mut self, file: impl Into<String>, output: Option<String>) {
        self.total += 1;
        self.successful += 1;
        self.details.push(BatchItem {
            file: file.into(),
            status: BatchStatus::Success,
            output,
            error: None,
        });
    }

    pub fn record_failure(&mut self, file: impl Into<String>, error: impl std::fmt::Display) {
        self.total += 1;
        self.failed += 1;
        self.details.push(BatchItem {
            file: file.into(),
            status: BatchStatus::Failed,
            output: None,
            error: Some(error.to_string()),
        });
    }
}

/// Compile a file name glob (`*`, `?`, `[...]`, `[!...]`).
pub fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern)
        .map_err(|e| VaultError::Config(format!("invalid file pattern '{pattern}': {e}")))
}

/// Files directly under `dir` whose names match `pattern`, sorted.
pub fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = compile_pattern(pattern)?;
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(crate::envelope::metadata::METADATA_SUFFIX) {
            continue;
        }
        if pattern.matches(name) && !entry.file_type()?.is_dir() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// Encrypt every file in `model_dir` matching `pattern` into `output_dir`
/// as `<name>.encrypted` plus its metadata sidecar.
pub async fn batch_encrypt(
    engine: &EnvelopeCryptoEngine,
    model_dir: &Path,
    output_dir: &Path,
    pattern: &str,
    custodian_key_ref: &str,
) -> Result<BatchSummary> {
    let files = matching_files(model_dir, pattern)?;
    tokio::fs::create_dir_all(output_dir).await?;
    tracing::info!(count = files.len(), dir = %model_dir.display(), pattern, "Batch encryption started");

    let mut summary = BatchSummary::default();
    for file in files {
        let name = display_name(&file);
        let output = output_dir.join(format!("{name}{ENCRYPTED_SUFFIX}"));
        match engine
            .encrypt_file(&file, &output, None, custodian_key_ref)
            .await
        {
            Ok(_) => summary.record_success(name, Some(output.display().to_string())),
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Batch item failed");
                summary.record_failure(name, e);
            }
        }
    }

    tracing::info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        "Batch encryption finished"
    );
    Ok(summary)
}

/// Decrypt every `*.encrypted` file in `encrypted_dir` into `output_dir`.
///
/// One verdict covers the batch; each key is still released through `gate`.
pub async fn batch_decrypt(
    engine: &EnvelopeCryptoEngine,
    gate: &KeyReleaseGate,
    verdict: &AttestationVerdict,
    encrypted_dir: &Path,
    output_dir: &Path,
) -> Result<BatchSummary> {
    let files = matching_files(encrypted_dir, &format!("*{ENCRYPTED_SUFFIX}"))?;
    tokio::fs::create_dir_all(output_dir).await?;
    tracing::info!(count = files.len(), dir = %encrypted_dir.display(), "Batch decryption started");

    let mut summary = BatchSummary::default();
    for file in files {
        let name = display_name(&file);
        let Some(plain_name) = decrypted_name(&file) else {
            summary.record_failure(name, "not an .encrypted artifact");
            continue;
        };
        let output = output_dir.join(plain_name);
        match engine
            .decrypt_file(&file, &output, None, gate, verdict)
            .await
        {
            Ok(_) => summary.record_success(name, Some(output.display().to_string())),
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Batch item failed");
                summary.record_failure(name, e);
            }
        }
    }

    tracing::info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        "Batch decryption finished"
    );
    Ok(summary)
}

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::tee::attestation::TcbLevel;

/// Checks applied to verified attestation results.
///
/// This is an extension point: the default implementation is
/// [`PolicyDocument`], which enforces a minimum TCB level and exact
/// required-claim matches. Each method returns `PolicyViolation` on failure.
pub trait VerdictPolicy: Send + Sync {
    /// Validate that the platform TCB level is acceptable.
    fn validate_tcb_level(&self, level: TcbLevel) -> Result<()>;

    /// Validate the verified claim set. Any missing or mismatched claim fails.
    fn validate_claims(&self, claims: &BTreeMap<String, String>) -> Result<()>;

    /// Lowest TCB level that may release a key.
    fn minimum_tcb_level(&self) -> TcbLevel;

    /// Whether a host with no TEE may still be treated as trusted.
    fn allows_unattested(&self) -> bool;
}

/// Largest magnitude at which every integral `f64` is exact (2^53).
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A required claim value as written in the policy file.
///
/// Values are compared against claims by canonical string form, so
/// `false`, `"false"` and `1`, `1.0`, `"1"` are equivalent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl ClaimValue {
    pub fn canonical(&self) -> String {
        match self {
            ClaimValue::Bool(b) => b.to_string(),
            ClaimValue::Number(n) => match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => {
                    (f as i64).to_string()
                }
                _ => n.to_string(),
            },
            ClaimValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        ClaimValue::Text(value.to_string())
    }
}

/// Key release policy. Loaded once and immutable for the life of a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_minimum_tcb")]
    pub minimum_tcb_level: TcbLevel,

    #[serde(default)]
    pub required_claims: BTreeMap<String, ClaimValue>,

    /// Treat hosts with no detected TEE as trusted (at TCB `unknown`).
    #[serde(default)]
    pub allow_unattested: bool,
}

/// On-disk wrapper: `{"version": "...", "attestationPolicy": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedPolicyFile {
    #[serde(default)]
    version: Option<String>,
    attestation_policy: PolicyDocument,
}

fn default_provider() -> String {
    "azure-dcap".to_string()
}

fn default_minimum_tcb() -> TcbLevel {
    TcbLevel::UpToDate
}

impl Default for PolicyDocument {
    fn default() -> Self {
        let mut required_claims = BTreeMap::new();
        required_claims.insert(
            "x-ms-sgx-is-debuggable".to_string(),
            ClaimValue::Bool(false),
        );
        required_claims.insert(
            "x-ms-sgx-product-id".to_string(),
            ClaimValue::Number(1.into()),
        );
        required_claims.insert("x-ms-sgx-svn".to_string(), ClaimValue::Number(1.into()));
        Self {
            provider: default_provider(),
            minimum_tcb_level: default_minimum_tcb(),
            required_claims,
            allow_unattested: false,
        }
    }
}

impl PolicyDocument {
    /// Policy with no claim requirements and the lowest TCB floor.
    /// A TEE is still required.
    pub fn permissive() -> Self {
        Self {
            provider: default_provider(),
            minimum_tcb_level: TcbLevel::Unknown,
            required_claims: BTreeMap::new(),
            allow_unattested: false,
        }
    }

    /// Load a policy file in either the flat or the wrapped form.
    ///
    /// A missing file yields the default policy. An unreadable or malformed
    /// file is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Attestation policy file not found, using default policy"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        let policy = Self::parse(&content).map_err(|e| {
            VaultError::Config(format!("Invalid policy file {}: {}", path.display(), e))
        })?;

        tracing::info!(
            path = %path.display(),
            provider = %policy.provider,
            minimum_tcb = %policy.minimum_tcb_level,
            required_claims = policy.required_claims.len(),
            "Attestation policy loaded"
        );
        Ok(policy)
    }

    /// Parse policy JSON in either form.
    pub fn parse(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if value.get("attestationPolicy").is_some() {
            let wrapped: WrappedPolicyFile = serde_json::from_value(value)?;
            if let Some(version) = wrapped.version.as_deref() {
                tracing::debug!(version, "Parsed wrapped policy file");
            }
            Ok(wrapped.attestation_policy)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }
}

impl VerdictPolicy for PolicyDocument {
    fn validate_tcb_level(&self, level: TcbLevel) -> Result<()> {
        if level >= self.minimum_tcb_level {
            Ok(())
        } else {
            Err(VaultError::PolicyViolation(format!(
                "TCB level '{}' is below the required minimum '{}'",
                level, self.minimum_tcb_level
            )))
        }
    }

    fn validate_claims(&self, claims: &BTreeMap<String, String>) -> Result<()> {
        let mut failures = Vec::new();
        for (name, expected) in &self.required_claims {
            let expected = expected.canonical();
            match claims.get(name) {
                None => failures.push(format!("required claim '{name}' is missing")),
                Some(actual) if *actual != expected => failures.push(format!(
                    "claim '{name}' mismatch: expected '{expected}', got '{actual}'"
                )),
                Some(_) => {}
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(VaultError::PolicyViolation(failures.join("; ")))
        }
    }

    fn minimum_tcb_level(&self) -> TcbLevel {
        self.minimum_tcb_level
    }

    fn allows_unattested(&self) -> bool {
        self.allow_unattested
    }
}

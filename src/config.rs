use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dirs;
use crate::error::{Result, VaultError};
use crate::tee::attestation::{EnvironmentKind, TcbLevel};

/// Which key custodian adapter to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustodianKind {
    /// RSA private key on local disk (development and air-gapped setups).
    #[default]
    Local,
    /// Remote key vault speaking the wrapkey/unwrapkey HTTP API.
    Http,
    /// No custodian; encrypt/decrypt are unavailable.
    None,
}

/// Key custodian settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodianConfig {
    #[serde(default)]
    pub kind: CustodianKind,

    /// Base URL of the key vault (required for `http`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Bearer token for the key vault. Usually supplied via `KEYVAULT_TOKEN`.
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,

    /// PEM-encoded RSA private key (required for `local`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    /// Name of the wrapping key inside the custodian.
    #[serde(default = "default_key_ref")]
    pub key_ref: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
}

/// Which attestation service adapter to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationKind {
    #[default]
    Http,
    /// Development only: fixed evidence and configured claims.
    Simulated,
}

/// Attestation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    #[serde(default)]
    pub kind: AttestationKind,

    /// Base URL of the attestation service (required for `http`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Release policy document.
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Per-call timeout in seconds.
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,

    /// Environment reported by the simulated probe. Ignored for `http`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_environment: Option<EnvironmentKind>,

    /// TCB level reported by the simulated attestation service.
    #[serde(default = "default_simulated_tcb")]
    pub simulated_tcb_level: TcbLevel,

    /// Claims reported by the simulated attestation service.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub simulated_claims: BTreeMap<String, String>,
}

/// Where artifacts and scratch copies live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    #[serde(default = "dirs::scratch_dir")]
    pub scratch_dir: PathBuf,
}

/// Retention bounds for the materialized model cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached models; least recently used is evicted. 0 = unbounded.
    #[serde(default = "default_max_cached_models")]
    pub max_cached_models: usize,

    /// Idle duration after which a cached model is evicted
    /// (e.g. "30m", "1h", "-1" = never).
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl: String,
}

/// Readiness probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_true")]
    pub attestation_required: bool,

    #[serde(default = "default_true")]
    pub custodian_check: bool,

    #[serde(default = "default_true")]
    pub model_check: bool,

    #[serde(default = "default_true")]
    pub port_check: bool,

    #[serde(default = "default_true")]
    pub liveness_check: bool,

    #[serde(default = "default_service_port")]
    pub service_port: u16,

    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,

    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,

    #[serde(default = "default_min_available_memory_mb")]
    pub min_available_memory_mb: u64,

    /// Upper bound for each individual check, in seconds.
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
}

/// Top-level configuration for the vault CLI and library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub custodian: CustodianConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,
}

fn default_key_ref() -> String {
    "model-encryption-key".to_string()
}

fn default_call_timeout() -> u64 {
    10
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("/etc/tee/attestation-policy.json")
}

fn default_simulated_tcb() -> TcbLevel {
    TcbLevel::UpToDate
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/models")
}

fn default_max_cached_models() -> usize {
    4
}

fn default_idle_ttl() -> String {
    "30m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_port() -> u16 {
    8000
}

fn default_liveness_path() -> String {
    "/health".to_string()
}

fn default_min_free_disk_mb() -> u64 {
    1024
}

fn default_min_available_memory_mb() -> u64 {
    512
}

fn default_readiness_timeout() -> u64 {
    30
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            kind: CustodianKind::default(),
            url: None,
            access_token: None,
            key_path: None,
            key_ref: default_key_ref(),
            timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            kind: AttestationKind::default(),
            endpoint: None,
            policy_path: default_policy_path(),
            timeout_secs: default_call_timeout(),
            simulated_environment: None,
            simulated_tcb_level: default_simulated_tcb(),
            simulated_claims: BTreeMap::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            scratch_dir: dirs::scratch_dir(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_models: default_max_cached_models(),
            idle_ttl: default_idle_ttl(),
        }
    }
}

impl CacheConfig {
    /// Idle TTL as a duration; `None` means entries never expire.
    pub fn idle_ttl(&self) -> Option<Duration> {
        let ttl = parse_duration(&self.idle_ttl);
        if ttl == Duration::MAX {
            None
        } else {
            Some(ttl)
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attestation_required: true,
            custodian_check: true,
            model_check: true,
            port_check: true,
            liveness_check: true,
            service_port: default_service_port(),
            liveness_path: default_liveness_path(),
            min_free_disk_mb: default_min_free_disk_mb(),
            min_available_memory_mb: default_min_available_memory_mb(),
            timeout_secs: default_readiness_timeout(),
        }
    }
}

/// Parse a duration string into a `std::time::Duration`.
///
/// Supported formats:
/// - `"30s"`, `"5m"`, `"1h"`
/// - `"120"` → raw seconds
/// - `"0"` → Duration::ZERO
/// - `"-1"` → Duration::MAX (never)
///
/// Unparsable input falls back to 30 minutes.
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();
    if s == "0" {
        return Duration::ZERO;
    }
    if s == "-1" {
        return Duration::MAX;
    }

    let suffixes: [(char, u64); 3] = [('s', 1), ('m', 60), ('h', 3600)];
    for (suffix, scale) in suffixes {
        if let Some(num_str) = s.strip_suffix(suffix) {
            if let Ok(n) = num_str.parse::<u64>() {
                return Duration::from_secs(n.saturating_mul(scale));
            }
        }
    }

    if let Ok(n) = s.parse::<u64>() {
        return Duration::from_secs(n);
    }

    Duration::from_secs(1800)
}

fn env_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl VaultConfig {
    /// Load configuration from the default config file path.
    /// Returns default config if the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(dirs::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist. Environment overrides are applied last.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                VaultError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply deployment environment variable overrides.
    ///
    /// Supported variables:
    /// - `KEYVAULT_URL`: remote custodian URL (switches the custodian to `http`)
    /// - `KEYVAULT_TOKEN`: bearer token for the remote custodian
    /// - `ATTESTATION_ENDPOINT`: attestation service URL
    /// - `ATTESTATION_POLICY`: release policy path
    /// - `ATTESTATION_REQUIRED`: `"false"` skips the readiness attestation check
    /// - `MODEL_PATH`: encrypted artifact directory
    /// - `SERVICE_PORT`: port probed by readiness
    /// - `A3S_VAULT_SCRATCH_DIR`: scratch directory for plaintext copies
    /// - `A3S_TEE_SIMULATE`: use simulated attestation (`"1"`, `"sgx"`, `"sev-snp"`, `"tdx"`)
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("KEYVAULT_URL") {
            if !url.trim().is_empty() {
                self.custodian.url = Some(url.trim().to_string());
                self.custodian.kind = CustodianKind::Http;
            }
        }

        if let Ok(token) = std::env::var("KEYVAULT_TOKEN") {
            self.custodian.access_token = Some(token);
        }

        if let Ok(endpoint) = std::env::var("ATTESTATION_ENDPOINT") {
            self.attestation.endpoint = Some(endpoint);
        }

        if let Ok(policy) = std::env::var("ATTESTATION_POLICY") {
            self.attestation.policy_path = PathBuf::from(policy);
        }

        if let Ok(required) = std::env::var("ATTESTATION_REQUIRED") {
            if let Some(flag) = env_flag(&required) {
                self.readiness.attestation_required = flag;
            }
        }

        if let Ok(model_path) = std::env::var("MODEL_PATH") {
            self.storage.artifact_dir = PathBuf::from(model_path);
        }

        if let Ok(port_str) = std::env::var("SERVICE_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.readiness.service_port = port;
            }
        }

        if let Ok(scratch) = std::env::var("A3S_VAULT_SCRATCH_DIR") {
            self.storage.scratch_dir = PathBuf::from(scratch);
        }

        if let Ok(simulate) = std::env::var("A3S_TEE_SIMULATE") {
            let kind = match env_flag(&simulate) {
                Some(true) => Some(EnvironmentKind::Sgx),
                Some(false) => None,
                None => simulate.parse::<EnvironmentKind>().ok(),
            };
            if let Some(kind) = kind {
                self.attestation.kind = AttestationKind::Simulated;
                self.attestation.simulated_environment = Some(kind);
            }
        }
    }

    /// Reject configurations that are missing a setting their adapter requires.
    pub fn validate(&self) -> Result<()> {
        match self.custodian.kind {
            CustodianKind::Http if self.custodian.url.is_none() => {
                return Err(VaultError::Config(
                    "custodian.kind = \"http\" requires custodian.url (or KEYVAULT_URL)"
                        .to_string(),
                ));
            }
            CustodianKind::Local if self.custodian.key_path.is_none() => {
                return Err(VaultError::Config(
                    "custodian.kind = \"local\" requires custodian.key_path".to_string(),
                ));
            }
            _ => {}
        }

        if self.custodian.key_ref.trim().is_empty() {
            return Err(VaultError::Config(
                "custodian.key_ref must not be empty".to_string(),
            ));
        }

        if self.attestation.kind == AttestationKind::Http && self.attestation.endpoint.is_none() {
            return Err(VaultError::Config(
                "attestation.kind = \"http\" requires attestation.endpoint (or ATTESTATION_ENDPOINT)"
                    .to_string(),
            ));
        }

        if self.custodian.timeout_secs == 0
            || self.attestation.timeout_secs == 0
            || self.readiness.timeout_secs == 0
        {
            return Err(VaultError::Config("timeouts must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Save the configuration to the given path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn custodian_timeout(&self) -> Duration {
        Duration::from_secs(self.custodian.timeout_secs)
    }

    pub fn attestation_timeout(&self) -> Duration {
        Duration::from_secs(self.attestation.timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "KEYVAULT_URL",
            "KEYVAULT_TOKEN",
            "ATTESTATION_ENDPOINT",
            "ATTESTATION_POLICY",
            "ATTESTATION_REQUIRED",
            "MODEL_PATH",
            "SERVICE_PORT",
            "A3S_VAULT_SCRATCH_DIR",
            "A3S_TEE_SIMULATE",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.custodian.kind, CustodianKind::Local);
        assert_eq!(config.custodian.key_ref, "model-encryption-key");
        assert_eq!(
            config.attestation.policy_path,
            PathBuf::from("/etc/tee/attestation-policy.json")
        );
        assert_eq!(config.storage.artifact_dir, PathBuf::from("/models"));
        assert_eq!(config.cache.max_cached_models, 4);
        assert!(config.readiness.attestation_required);
        assert_eq!(config.readiness.service_port, 8000);
        assert_eq!(config.readiness.timeout_secs, 30);
    }

    #[test]
    fn test_config_deserialize_sections() {
        let toml_str = r#"
            [custodian]
            kind = "http"
            url = "https://vault.example.net"
            key_ref = "llm-wrap"

            [attestation]
            kind = "simulated"
            simulated_environment = "sev-snp"
            simulated_tcb_level = "outOfDate"

            [attestation.simulated_claims]
            "x-ms-sgx-is-debuggable" = "false"

            [cache]
            max_cached_models = 2
            idle_ttl = "1h"

            [readiness]
            service_port = 9000
            port_check = false
        "#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.custodian.kind, CustodianKind::Http);
        assert_eq!(config.custodian.key_ref, "llm-wrap");
        assert_eq!(config.attestation.kind, AttestationKind::Simulated);
        assert_eq!(
            config.attestation.simulated_environment,
            Some(EnvironmentKind::SevSnp)
        );
        assert_eq!(config.attestation.simulated_tcb_level, TcbLevel::OutOfDate);
        assert_eq!(
            config.attestation.simulated_claims["x-ms-sgx-is-debuggable"],
            "false"
        );
        assert_eq!(config.cache.idle_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.readiness.service_port, 9000);
        assert!(!config.readiness.port_check);
        assert!(config.readiness.model_check);
    }

    #[test]
    #[serial]
    fn test_config_roundtrip() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = VaultConfig::default();
        config.custodian.key_path = Some(dir.path().join("wrap.pem"));
        config.storage.artifact_dir = dir.path().join("models");
        config.cache.max_cached_models = 7;
        config.readiness.liveness_path = "/livez".to_string();
        config.save_to(&path).unwrap();

        let loaded = VaultConfig::load_from(&path).unwrap();
        assert_eq!(loaded.custodian.key_path, Some(dir.path().join("wrap.pem")));
        assert_eq!(loaded.storage.artifact_dir, dir.path().join("models"));
        assert_eq!(loaded.cache.max_cached_models, 7);
        assert_eq!(loaded.readiness.liveness_path, "/livez");
    }

    #[test]
    #[serial]
    fn test_load_missing_file_returns_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.readiness.service_port, 8000);
    }

    #[test]
    #[serial]
    fn test_load_malformed_file_is_error() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[custodian\nkind = ").unwrap();
        assert!(matches!(
            VaultConfig::load_from(&path),
            Err(VaultError::TomlDe(_))
        ));
    }

    #[test]
    fn test_access_token_never_serialized() {
        let mut config = VaultConfig::default();
        config.custodian.access_token = Some("secret-token".to_string());
        let serialized = toml::to_string_pretty(&config).unwrap();
        assert!(!serialized.contains("secret-token"));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s"), Duration::from_secs(30));
        assert_eq!(parse_duration("5m"), Duration::from_secs(300));
        assert_eq!(parse_duration("1h"), Duration::from_secs(3600));
        assert_eq!(parse_duration("120"), Duration::from_secs(120));
        assert_eq!(parse_duration("0"), Duration::ZERO);
        assert_eq!(parse_duration("-1"), Duration::MAX);
        assert_eq!(parse_duration("soon"), Duration::from_secs(1800));
    }

    #[test]
    fn test_idle_ttl_never() {
        let cache = CacheConfig {
            max_cached_models: 0,
            idle_ttl: "-1".to_string(),
        };
        assert_eq!(cache.idle_ttl(), None);
    }

    // ---------------------------------------------------------------
    // Environment variable override tests
    // ---------------------------------------------------------------

    #[test]
    #[serial]
    fn test_env_keyvault_url_switches_to_http() {
        clear_env();
        std::env::set_var("KEYVAULT_URL", "https://kv.example.net");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.custodian.kind, CustodianKind::Http);
        assert_eq!(config.custodian.url.as_deref(), Some("https://kv.example.net"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_model_path_and_port() {
        clear_env();
        std::env::set_var("MODEL_PATH", "/srv/models");
        std::env::set_var("SERVICE_PORT", "8443");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.storage.artifact_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.readiness.service_port, 8443);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_invalid_port_ignored() {
        clear_env();
        std::env::set_var("SERVICE_PORT", "eighty");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.readiness.service_port, 8000);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_attestation_required_false() {
        clear_env();
        std::env::set_var("ATTESTATION_REQUIRED", "false");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert!(!config.readiness.attestation_required);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_tee_simulate_kind() {
        clear_env();
        std::env::set_var("A3S_TEE_SIMULATE", "tdx");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.attestation.kind, AttestationKind::Simulated);
        assert_eq!(
            config.attestation.simulated_environment,
            Some(EnvironmentKind::Tdx)
        );

        std::env::set_var("A3S_TEE_SIMULATE", "1");
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        assert_eq!(
            config.attestation.simulated_environment,
            Some(EnvironmentKind::Sgx)
        );
        clear_env();
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn test_validate_http_custodian_requires_url() {
        let mut config = VaultConfig::default();
        config.custodian.kind = CustodianKind::Http;
        config.attestation.kind = AttestationKind::Simulated;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("custodian.url"));
    }

    #[test]
    fn test_validate_local_custodian_requires_key_path() {
        let mut config = VaultConfig::default();
        config.attestation.kind = AttestationKind::Simulated;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_path"));
    }

    #[test]
    fn test_validate_http_attestation_requires_endpoint() {
        let mut config = VaultConfig::default();
        config.custodian.kind = CustodianKind::None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("attestation.endpoint"));
    }

    #[test]
    fn test_validate_ok() {
        let mut config = VaultConfig::default();
        config.custodian.key_path = Some(PathBuf::from("/etc/tee/wrap.pem"));
        config.attestation.endpoint = Some("https://attest.example.net".to_string());
        assert!(config.validate().is_ok());
    }
}

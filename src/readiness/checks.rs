//! The standard readiness checks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::custody::KeyCustodian;
use crate::error::VaultError;
use crate::readiness::{CheckStatus, ReadinessCheck};
use crate::tee::detect::EnvironmentProbe;
use crate::tee::gate::KeyReleaseGate;

/// File extensions counted as model artifacts.
pub const MODEL_EXTENSIONS: [&str; 8] = [
    "encrypted",
    "pt",
    "pth",
    "onnx",
    "pb",
    "h5",
    "gguf",
    "safetensors",
];

const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);
const MIB: u64 = 1024 * 1024;

/// A check whose collaborators could not be constructed.
pub struct UnavailableCheck {
    name: &'static str,
    reason: String,
}

impl UnavailableCheck {
    pub fn new(name: &'static str, reason: impl std::fmt::Display) -> Self {
        Self {
            name,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for UnavailableCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self) -> CheckStatus {
        CheckStatus::fail(self.reason.clone())
    }
}

/// Passes iff a fresh attestation verdict is trusted.
pub struct AttestationCheck {
    gate: Option<(Arc<KeyReleaseGate>, Arc<dyn EnvironmentProbe>)>,
}

impl AttestationCheck {
    pub fn new(gate: Arc<KeyReleaseGate>, probe: Arc<dyn EnvironmentProbe>) -> Self {
        Self {
            gate: Some((gate, probe)),
        }
    }

    /// Attestation is not required; always skips.
    pub fn not_required() -> Self {
        Self { gate: None }
    }
}

#[async_trait]
impl ReadinessCheck for AttestationCheck {
    fn name(&self) -> &'static str {
        "attestation"
    }

    async fn run(&self) -> CheckStatus {
        let Some((gate, probe)) = &self.gate else {
            return CheckStatus::skip("attestation not required");
        };
        match gate.authorize(probe.as_ref()).await {
            Ok(verdict) if verdict.trusted => CheckStatus::pass(format!(
                "{} verdict trusted (tcb {})",
                verdict.environment_kind, verdict.tcb_level
            )),
            Ok(verdict) => CheckStatus::fail(format!(
                "{} verdict rejected: {}",
                verdict.environment_kind,
                verdict.failures.join("; ")
            )),
            Err(e) => CheckStatus::fail(e.to_string()),
        }
    }
}

/// Custodian reachability and key usability.
pub struct CustodianCheck {
    custodian: Option<Arc<dyn KeyCustodian>>,
    key_ref: String,
}

impl CustodianCheck {
    /// `None` skips the check.
    pub fn new(custodian: Option<Arc<dyn KeyCustodian>>, key_ref: impl Into<String>) -> Self {
        Self {
            custodian,
            key_ref: key_ref.into(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for CustodianCheck {
    fn name(&self) -> &'static str {
        "custodian"
    }

    async fn run(&self) -> CheckStatus {
        let Some(custodian) = &self.custodian else {
            return CheckStatus::skip("no key custodian configured");
        };
        match custodian.health_check(&self.key_ref).await {
            Ok(()) => CheckStatus::pass(format!(
                "{} custodian reachable, key '{}' usable",
                custodian.custodian_name(),
                self.key_ref
            )),
            Err(e) => CheckStatus::fail(e.to_string()),
        }
    }
}

/// At least one model artifact is present.
pub struct ModelsCheck {
    artifact_dir: Option<PathBuf>,
}

impl ModelsCheck {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: Some(artifact_dir.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { artifact_dir: None }
    }
}

/// Count recognised model artifacts directly under `dir`.
pub fn count_model_artifacts(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let recognised = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MODEL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if recognised && path.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

#[async_trait]
impl ReadinessCheck for ModelsCheck {
    fn name(&self) -> &'static str {
        "models"
    }

    async fn run(&self) -> CheckStatus {
        let Some(dir) = &self.artifact_dir else {
            return CheckStatus::skip("model check disabled");
        };
        if !dir.is_dir() {
            return CheckStatus::fail(format!("artifact directory {} not found", dir.display()));
        }
        match count_model_artifacts(dir) {
            Ok(0) => CheckStatus::fail(format!("no model artifacts in {}", dir.display())),
            Ok(n) => CheckStatus::pass(format!("{n} model artifact(s) in {}", dir.display())),
            Err(e) => CheckStatus::fail(format!("cannot list {}: {e}", dir.display())),
        }
    }
}

/// Disk and memory headroom.
pub struct ResourcesCheck {
    path: PathBuf,
    min_free_disk_mb: u64,
    min_available_memory_mb: u64,
}

impl ResourcesCheck {
    pub fn new(path: impl Into<PathBuf>, min_free_disk_mb: u64, min_available_memory_mb: u64) -> Self {
        Self {
            path: path.into(),
            min_free_disk_mb,
            min_available_memory_mb,
        }
    }
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
///
/// Walks up to the nearest existing ancestor so a not-yet-created
/// directory still reports its future filesystem.
pub fn free_disk_bytes(path: &Path) -> std::io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let stat = nix::sys::statvfs::statvfs(existing).map_err(std::io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// MemAvailable from `/proc/meminfo`, or `None` when unavailable.
pub fn available_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available(&content)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    // "MemAvailable:   123456 kB"
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[async_trait]
impl ReadinessCheck for ResourcesCheck {
    fn name(&self) -> &'static str {
        "resources"
    }

    async fn run(&self) -> CheckStatus {
        let mut problems = Vec::new();
        let mut facts = Vec::new();

        match free_disk_bytes(&self.path) {
            Ok(free) => {
                let free_mb = free / MIB;
                facts.push(format!("disk {free_mb} MiB free"));
                if free_mb < self.min_free_disk_mb {
                    problems.push(format!(
                        "free disk {free_mb} MiB below {} MiB",
                        self.min_free_disk_mb
                    ));
                }
            }
            Err(e) => problems.push(format!("cannot stat {}: {e}", self.path.display())),
        }

        match available_memory_bytes() {
            Some(available) => {
                let available_mb = available / MIB;
                facts.push(format!("memory {available_mb} MiB available"));
                if available_mb < self.min_available_memory_mb {
                    problems.push(format!(
                        "available memory {available_mb} MiB below {} MiB",
                        self.min_available_memory_mb
                    ));
                }
            }
            None => facts.push("memory info unavailable".to_string()),
        }

        if problems.is_empty() {
            CheckStatus::pass(facts.join(", "))
        } else {
            CheckStatus::fail(VaultError::ResourceExhausted(problems.join("; ")).to_string())
        }
    }
}

/// The service port accepts TCP connections.
pub struct PortCheck {
    port: Option<u16>,
}

impl PortCheck {
    pub fn new(port: u16) -> Self {
        Self { port: Some(port) }
    }

    pub fn disabled() -> Self {
        Self { port: None }
    }
}

#[async_trait]
impl ReadinessCheck for PortCheck {
    fn name(&self) -> &'static str {
        "port"
    }

    async fn run(&self) -> CheckStatus {
        let Some(port) = self.port else {
            return CheckStatus::skip("port check disabled");
        };
        let addr = ("127.0.0.1", port);
        match tokio::time::timeout(PORT_CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => CheckStatus::pass(format!("port {port} accepting connections")),
            Ok(Err(e)) => CheckStatus::fail(format!("port {port} not accepting connections: {e}")),
            Err(_) => CheckStatus::fail(format!(
                "port {port} connect timed out after {}s",
                PORT_CONNECT_TIMEOUT.as_secs()
            )),
        }
    }
}

/// The service health endpoint answers 200.
pub struct LivenessCheck {
    url: Option<String>,
}

impl LivenessCheck {
    pub fn new(port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            url: Some(format!("http://127.0.0.1:{port}{path}")),
        }
    }

    pub fn disabled() -> Self {
        Self { url: None }
    }
}

#[async_trait]
impl ReadinessCheck for LivenessCheck {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn run(&self) -> CheckStatus {
        let Some(url) = &self.url else {
            return CheckStatus::skip("liveness check disabled");
        };
        let client = match reqwest::Client::builder().timeout(LIVENESS_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => return CheckStatus::fail(format!("cannot build HTTP client: {e}")),
        };
        match client.get(url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                CheckStatus::pass(format!("{url} returned 200"))
            }
            Ok(resp) => CheckStatus::fail(format!("{url} returned {}", resp.status())),
            Err(e) => CheckStatus::fail(format!("{url} unreachable: {e}")),
        }
    }
}

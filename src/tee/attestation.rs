use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Claim carrying the vendor TCB rating in verified attestation results.
pub const TCB_LEVEL_CLAIM: &str = "tcb-level";

/// Hardware isolation technology the process is running under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    /// Intel SGX enclave
    Sgx,
    /// AMD SEV-SNP confidential VM
    SevSnp,
    /// Intel TDX trust domain
    Tdx,
    /// No TEE detected
    None,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::Sgx => write!(f, "sgx"),
            EnvironmentKind::SevSnp => write!(f, "sev-snp"),
            EnvironmentKind::Tdx => write!(f, "tdx"),
            EnvironmentKind::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "sgx" => Ok(EnvironmentKind::Sgx),
            "sev-snp" | "snp" => Ok(EnvironmentKind::SevSnp),
            "tdx" => Ok(EnvironmentKind::Tdx),
            "none" => Ok(EnvironmentKind::None),
            other => Err(VaultError::Config(format!(
                "Unknown TEE environment '{other}'"
            ))),
        }
    }
}

/// Vendor freshness rating of the platform TCB, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TcbLevel {
    Unknown,
    OutOfDate,
    ConfigNeeded,
    UpToDate,
}

impl TcbLevel {
    /// Parse a TCB level, ignoring case, `-` and `_` (`"UpToDate"`, `"up_to_date"`, `"uptodate"`).
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "unknown" => Some(TcbLevel::Unknown),
            "outofdate" => Some(TcbLevel::OutOfDate),
            "configneeded" => Some(TcbLevel::ConfigNeeded),
            "uptodate" => Some(TcbLevel::UpToDate),
            _ => None,
        }
    }

    /// Read the level from a claim set. Missing or unrecognized values are `Unknown`.
    pub fn from_claims(claims: &BTreeMap<String, String>) -> Self {
        claims
            .get(TCB_LEVEL_CLAIM)
            .or_else(|| claims.get("tcbLevel"))
            .and_then(|v| Self::parse(v))
            .unwrap_or(TcbLevel::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TcbLevel::Unknown => "unknown",
            TcbLevel::OutOfDate => "outOfDate",
            TcbLevel::ConfigNeeded => "configNeeded",
            TcbLevel::UpToDate => "upToDate",
        }
    }
}

impl std::fmt::Display for TcbLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TcbLevel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown TCB level '{value}'"))
    }
}

impl From<TcbLevel> for String {
    fn from(level: TcbLevel) -> Self {
        level.as_str().to_string()
    }
}

/// Position of an authorization request in the release state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Unvalidated,
    Probing,
    EvidenceCollected,
    Trusted,
    Rejected,
}

/// Result of a single authorization. Never reused across decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationVerdict {
    pub environment_kind: EnvironmentKind,
    pub trusted: bool,
    pub tcb_level: TcbLevel,
    pub claims: BTreeMap<String, String>,
    #[serde(with = "hex_bytes")]
    pub raw_evidence: Vec<u8>,
    /// Terminal state: `Trusted` or `Rejected`.
    pub state: GateState,
    /// Why the verdict was rejected. Empty when trusted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    /// Detection details (device paths, flags).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detection: BTreeMap<String, String>,
    pub produced_at: chrono::DateTime<chrono::Utc>,
}

impl AttestationVerdict {
    /// A terminal rejection with no evidence.
    pub fn rejected(
        environment_kind: EnvironmentKind,
        detection: BTreeMap<String, String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            environment_kind,
            trusted: false,
            tcb_level: TcbLevel::Unknown,
            claims: BTreeMap::new(),
            raw_evidence: Vec::new(),
            state: GateState::Rejected,
            failures: vec![reason.into()],
            detection,
            produced_at: chrono::Utc::now(),
        }
    }
}

/// External attestation service: collects vendor evidence and verifies it.
///
/// Implementations talk to real vendor tooling; the gate only consumes the
/// verified claim set. A well-formed refusal is `InvalidToken`, anything
/// that prevented an answer is `Transport`.
#[async_trait::async_trait]
pub trait AttestationService: Send + Sync {
    /// Produce raw evidence (quote/report) for the detected environment.
    async fn collect_evidence(&self, kind: EnvironmentKind) -> Result<Vec<u8>>;

    /// Verify an evidence token remotely and return its claims.
    async fn verify_remote(&self, token: &str) -> Result<BTreeMap<String, String>>;

    /// Service name for logging and diagnostics.
    fn service_name(&self) -> &str;
}

/// Encode raw evidence as the token passed to `verify_remote`.
pub fn evidence_token(evidence: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(evidence)
}

const SIMULATED_MAGIC: &[u8; 8] = b"A3SSIMQ1";

/// Development attestation service.
///
/// Evidence is a fixed simulated quote; verification accepts only tokens
/// carrying that quote and returns the configured claims.
#[derive(Debug, Clone)]
pub struct SimulatedAttestationService {
    claims: BTreeMap<String, String>,
    tcb_level: TcbLevel,
}

impl SimulatedAttestationService {
    pub fn new(claims: BTreeMap<String, String>, tcb_level: TcbLevel) -> Self {
        Self { claims, tcb_level }
    }

    fn simulated_quote(kind: EnvironmentKind) -> Vec<u8> {
        let mut quote = Vec::with_capacity(8 + 1 + 64 + 48);
        quote.extend_from_slice(SIMULATED_MAGIC);
        quote.push(match kind {
            EnvironmentKind::Sgx => 1,
            EnvironmentKind::SevSnp => 2,
            EnvironmentKind::Tdx => 3,
            EnvironmentKind::None => 0,
        });
        quote.extend_from_slice(&[0xAA; 64]);
        quote.extend_from_slice(&[0xBB; 48]);
        quote
    }
}

#[async_trait::async_trait]
impl AttestationService for SimulatedAttestationService {
    async fn collect_evidence(&self, kind: EnvironmentKind) -> Result<Vec<u8>> {
        if kind == EnvironmentKind::None {
            return Err(VaultError::Config(
                "No TEE environment to collect evidence from".to_string(),
            ));
        }
        Ok(Self::simulated_quote(kind))
    }

    async fn verify_remote(&self, token: &str) -> Result<BTreeMap<String, String>> {
        let quote = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| VaultError::InvalidToken(format!("token is not base64: {e}")))?;
        if !quote.starts_with(SIMULATED_MAGIC) {
            return Err(VaultError::InvalidToken(
                "token does not carry a simulated quote".to_string(),
            ));
        }
        let mut claims = self.claims.clone();
        claims.insert(TCB_LEVEL_CLAIM.to_string(), self.tcb_level.to_string());
        Ok(claims)
    }

    fn service_name(&self) -> &str {
        "simulated"
    }
}

/// Hex serialization for evidence bytes.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex_str = String::deserialize(d)?;
        hex::decode(hex_str).map_err(serde::de::Error::custom)
    }
}

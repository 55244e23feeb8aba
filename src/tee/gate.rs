//! Attestation-gated key release.
//!
//! [`KeyReleaseGate::authorize`] walks the release state machine
//! (`UNVALIDATED → PROBING → EVIDENCE_COLLECTED → TRUSTED | REJECTED`) and
//! returns a fresh verdict. [`KeyReleaseGate::unwrap_dek`] is the only place
//! in the crate that asks the custodian to unwrap a data key, and it refuses
//! unless the verdict is trusted at or above the policy's TCB floor.

use std::sync::Arc;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::custody::KeyCustodian;
use crate::deadline::with_deadline;
use crate::envelope::metadata::EncryptionMetadata;
use crate::error::{Result, VaultError};
use crate::tee::attestation::{
    evidence_token, AttestationService, AttestationVerdict, EnvironmentKind, GateState, TcbLevel,
};
use crate::tee::detect::{self, DetectionRule, EnvironmentProbe};
use crate::tee::policy::{PolicyDocument, VerdictPolicy};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KeyReleaseGate {
    policy: PolicyDocument,
    attestation: Arc<dyn AttestationService>,
    custodian: Option<Arc<dyn KeyCustodian>>,
    rules: Vec<DetectionRule>,
    timeout: Duration,
}

impl std::fmt::Debug for KeyReleaseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyReleaseGate")
            .field("policy", &self.policy)
            .field("attestation", &self.attestation.service_name())
            .field(
                "custodian",
                &self.custodian.as_ref().map(|c| c.custodian_name().to_string()),
            )
            .field("rules", &self.rules)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn transition(from: GateState, to: GateState) {
    tracing::debug!(?from, ?to, "Key release state transition");
}

impl KeyReleaseGate {
    /// Create a gate with the default detection rules. The policy is fixed
    /// for the life of the gate; reloading means constructing a new one.
    pub fn new(policy: PolicyDocument, attestation: Arc<dyn AttestationService>) -> Self {
        Self {
            policy,
            attestation,
            custodian: None,
            rules: detect::default_rules(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_custodian(mut self, custodian: Arc<dyn KeyCustodian>) -> Self {
        self.custodian = Some(custodian);
        self
    }

    pub fn with_rules(mut self, rules: Vec<DetectionRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Deadline applied to each attestation and custodian call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &PolicyDocument {
        &self.policy
    }

    /// Produce a fresh verdict for the environment seen through `probe`.
    ///
    /// A negative answer is returned as a rejected verdict. Only transport or
    /// configuration problems with the attestation service are errors.
    pub async fn authorize(&self, probe: &dyn EnvironmentProbe) -> Result<AttestationVerdict> {
        transition(GateState::Unvalidated, GateState::Probing);
        let detection = detect::detect(probe, &self.rules);

        if detection.kind == EnvironmentKind::None {
            if self.policy.allows_unattested() {
                if self.policy.minimum_tcb_level() > TcbLevel::Unknown {
                    tracing::warn!(
                        minimum_tcb = %self.policy.minimum_tcb_level(),
                        "Unattested operation allowed but the TCB floor will block key release"
                    );
                }
                transition(GateState::Unvalidated, GateState::Trusted);
                tracing::warn!("No TEE detected; policy allows unattested operation");
                return Ok(AttestationVerdict {
                    environment_kind: EnvironmentKind::None,
                    trusted: true,
                    tcb_level: TcbLevel::Unknown,
                    claims: Default::default(),
                    raw_evidence: Vec::new(),
                    state: GateState::Trusted,
                    failures: Vec::new(),
                    detection: detection.details,
                    produced_at: chrono::Utc::now(),
                });
            }
            transition(GateState::Unvalidated, GateState::Rejected);
            tracing::warn!("No TEE detected; key release rejected");
            return Ok(AttestationVerdict::rejected(
                EnvironmentKind::None,
                detection.details,
                "no TEE environment detected",
            ));
        }

        let kind = detection.kind;
        let evidence = with_deadline(
            self.timeout,
            "attestation evidence collection",
            self.attestation.collect_evidence(kind),
        )
        .await?;
        transition(GateState::Probing, GateState::EvidenceCollected);

        let token = evidence_token(&evidence);
        let claims = match with_deadline(
            self.timeout,
            "remote attestation",
            self.attestation.verify_remote(&token),
        )
        .await
        {
            Ok(claims) => claims,
            Err(VaultError::InvalidToken(reason)) => {
                transition(GateState::EvidenceCollected, GateState::Rejected);
                tracing::warn!(tee = %kind, %reason, "Attestation token rejected");
                let mut verdict = AttestationVerdict::rejected(
                    kind,
                    detection.details,
                    format!("attestation token rejected: {reason}"),
                );
                verdict.raw_evidence = evidence;
                return Ok(verdict);
            }
            Err(e) => return Err(e),
        };

        let tcb_level = TcbLevel::from_claims(&claims);
        let mut failures = Vec::new();
        if let Err(e) = self.policy.validate_tcb_level(tcb_level) {
            failures.push(e.to_string());
        }
        if let Err(e) = self.policy.validate_claims(&claims) {
            failures.push(e.to_string());
        }

        let trusted = failures.is_empty();
        let state = if trusted {
            GateState::Trusted
        } else {
            GateState::Rejected
        };
        transition(GateState::EvidenceCollected, state);

        if trusted {
            tracing::info!(tee = %kind, tcb = %tcb_level, "Attestation verdict trusted");
        } else {
            tracing::warn!(tee = %kind, tcb = %tcb_level, ?failures, "Attestation verdict rejected");
        }

        Ok(AttestationVerdict {
            environment_kind: kind,
            trusted,
            tcb_level,
            claims,
            raw_evidence: evidence,
            state,
            failures,
            detection: detection.details,
            produced_at: chrono::Utc::now(),
        })
    }

    /// Release the data key for `metadata` if `verdict` permits it.
    pub async fn unwrap_dek(
        &self,
        metadata: &EncryptionMetadata,
        verdict: &AttestationVerdict,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if !verdict.trusted {
            let reason = if verdict.failures.is_empty() {
                String::new()
            } else {
                format!(" ({})", verdict.failures.join("; "))
            };
            return Err(VaultError::PolicyViolation(format!(
                "key release for '{}' refused: attestation verdict is not trusted{reason}",
                metadata.artifact_name
            )));
        }
        if verdict.tcb_level < self.policy.minimum_tcb_level() {
            return Err(VaultError::PolicyViolation(format!(
                "key release for '{}' refused: TCB level '{}' is below '{}'",
                metadata.artifact_name,
                verdict.tcb_level,
                self.policy.minimum_tcb_level()
            )));
        }

        let custodian = self.custodian.as_ref().ok_or_else(|| {
            VaultError::Config("no key custodian configured for key release".to_string())
        })?;
        let wrapped = metadata.wrapped_dek()?;

        let dek = with_deadline(
            self.timeout,
            "custodian unwrap",
            custodian.unwrap(&metadata.custodian_key_ref, &wrapped),
        )
        .await?;
        tracing::debug!(
            artifact = %metadata.artifact_name,
            key_ref = %metadata.custodian_key_ref,
            custodian = custodian.custodian_name(),
            "Data key released"
        );
        Ok(dek)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::attestation::SimulatedAttestationService;
    use crate::tee::detect::StaticProbe;
    use crate::test_utils::{CountingCustodian, ScriptedAttestation};
    use std::collections::BTreeMap;

    fn good_claims() -> BTreeMap<String, String> {
        [
            ("x-ms-sgx-is-debuggable", "false"),
            ("x-ms-sgx-product-id", "1"),
            ("x-ms-sgx-svn", "1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn simulated(claims: BTreeMap<String, String>, tcb: TcbLevel) -> Arc<dyn AttestationService> {
        Arc::new(SimulatedAttestationService::new(claims, tcb))
    }

    #[tokio::test]
    async fn test_no_tee_is_rejected() {
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        );
        let verdict = gate.authorize(&StaticProbe::new()).await.unwrap();
        assert!(!verdict.trusted);
        assert_eq!(verdict.environment_kind, EnvironmentKind::None);
        assert_eq!(verdict.state, GateState::Rejected);
        assert!(verdict.raw_evidence.is_empty());
    }

    #[tokio::test]
    async fn test_no_tee_skips_evidence_collection() {
        let attestation = Arc::new(ScriptedAttestation::trusted(good_claims()));
        let gate = KeyReleaseGate::new(PolicyDocument::default(), attestation.clone());
        gate.authorize(&StaticProbe::new()).await.unwrap();
        assert_eq!(attestation.evidence_calls(), 0);
        assert_eq!(attestation.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_allow_unattested() {
        let mut policy = PolicyDocument::permissive();
        policy.allow_unattested = true;
        let gate = KeyReleaseGate::new(policy, simulated(BTreeMap::new(), TcbLevel::UpToDate));
        let verdict = gate.authorize(&StaticProbe::new()).await.unwrap();
        assert!(verdict.trusted);
        assert_eq!(verdict.tcb_level, TcbLevel::Unknown);
        assert_eq!(verdict.state, GateState::Trusted);
    }

    #[tokio::test]
    async fn test_trusted_sgx_verdict() {
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        );
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap();
        assert!(verdict.trusted, "failures: {:?}", verdict.failures);
        assert_eq!(verdict.environment_kind, EnvironmentKind::Sgx);
        assert_eq!(verdict.tcb_level, TcbLevel::UpToDate);
        assert_eq!(verdict.detection["dcap"], "true");
        assert!(!verdict.raw_evidence.is_empty());
    }

    #[tokio::test]
    async fn test_debuggable_enclave_rejected_even_when_up_to_date() {
        let mut claims = good_claims();
        claims.insert("x-ms-sgx-is-debuggable".to_string(), "true".to_string());
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(claims, TcbLevel::UpToDate),
        );
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap();
        assert!(!verdict.trusted);
        assert_eq!(verdict.tcb_level, TcbLevel::UpToDate);
        assert!(verdict.failures[0].contains("x-ms-sgx-is-debuggable"));
    }

    #[tokio::test]
    async fn test_low_tcb_rejected() {
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::OutOfDate),
        );
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Tdx))
            .await
            .unwrap();
        assert!(!verdict.trusted);
        assert!(verdict.failures[0].contains("below the required minimum"));
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejection_not_error() {
        let attestation = Arc::new(ScriptedAttestation::invalid_token());
        let gate = KeyReleaseGate::new(PolicyDocument::default(), attestation);
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::SevSnp))
            .await
            .unwrap();
        assert!(!verdict.trusted);
        assert!(verdict.failures[0].contains("attestation token rejected"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_error() {
        let attestation = Arc::new(ScriptedAttestation::unreachable());
        let gate = KeyReleaseGate::new(PolicyDocument::default(), attestation);
        let err = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attestation_times_out() {
        let attestation = Arc::new(
            ScriptedAttestation::trusted(good_claims()).with_delay(Duration::from_secs(60)),
        );
        let gate = KeyReleaseGate::new(PolicyDocument::default(), attestation)
            .with_timeout(Duration::from_secs(1));
        let err = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unwrap_refused_for_rejected_verdict() {
        let custodian = Arc::new(CountingCustodian::new("wrap-key"));
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        )
        .with_custodian(custodian.clone());

        let metadata = custodian.sample_metadata().await;
        let verdict = gate.authorize(&StaticProbe::new()).await.unwrap();
        let err = gate.unwrap_dek(&metadata, &verdict).await.unwrap_err();
        assert!(matches!(err, VaultError::PolicyViolation(_)));
        assert_eq!(custodian.unwrap_calls(), 0);
    }

    #[tokio::test]
    async fn test_unwrap_refused_below_tcb_floor() {
        let custodian = Arc::new(CountingCustodian::new("wrap-key"));
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        )
        .with_custodian(custodian.clone());

        let metadata = custodian.sample_metadata().await;
        let mut verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap();
        verdict.tcb_level = TcbLevel::ConfigNeeded;
        let err = gate.unwrap_dek(&metadata, &verdict).await.unwrap_err();
        assert!(err.to_string().contains("below"));
        assert_eq!(custodian.unwrap_calls(), 0);
    }

    #[tokio::test]
    async fn test_unwrap_with_trusted_verdict() {
        let custodian = Arc::new(CountingCustodian::new("wrap-key"));
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        )
        .with_custodian(custodian.clone());

        let metadata = custodian.sample_metadata().await;
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap();
        let dek = gate.unwrap_dek(&metadata, &verdict).await.unwrap();
        assert_eq!(dek.len(), 32);
        assert_eq!(custodian.unwrap_calls(), 1);
    }

    #[tokio::test]
    async fn test_unwrap_without_custodian_is_config_error() {
        let gate = KeyReleaseGate::new(
            PolicyDocument::default(),
            simulated(good_claims(), TcbLevel::UpToDate),
        );
        let custodian = CountingCustodian::new("wrap-key");
        let metadata = custodian.sample_metadata().await;
        let verdict = gate
            .authorize(&StaticProbe::for_environment(EnvironmentKind::Sgx))
            .await
            .unwrap();
        let err = gate.unwrap_dek(&metadata, &verdict).await.unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}

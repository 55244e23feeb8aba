//! Explicitly wired collaborators.
//!
//! The custodian and attestation clients are built lazily, exactly once,
//! and shared read-only afterwards. Components receive them through
//! [`Collaborators`] rather than from process-wide globals.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{AttestationKind, VaultConfig};
use crate::custody::{self, KeyCustodian};
use crate::envelope::EnvelopeCryptoEngine;
use crate::error::{Result, VaultError};
use crate::model::format::PassthroughLoader;
use crate::model::materializer::{ModelMaterializer, RetentionBounds};
use crate::model::scratch::ScratchDir;
use crate::readiness::checks::{
    AttestationCheck, CustodianCheck, LivenessCheck, ModelsCheck, PortCheck, ResourcesCheck,
    UnavailableCheck,
};
use crate::readiness::{ConfigSummary, ReadinessAggregator};
use crate::tee::attestation::{AttestationService, SimulatedAttestationService};
use crate::tee::detect::{EnvironmentProbe, StaticProbe, SystemProbe};
use crate::tee::gate::KeyReleaseGate;
use crate::tee::policy::PolicyDocument;
use crate::tee::remote::HttpAttestationService;

pub struct Collaborators {
    config: VaultConfig,
    custodian: OnceCell<Option<Arc<dyn KeyCustodian>>>,
    attestation: OnceCell<Arc<dyn AttestationService>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("custodian_initialized", &self.custodian.initialized())
            .field("attestation_initialized", &self.attestation.initialized())
            .finish()
    }
}

impl Collaborators {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            custodian: OnceCell::new(),
            attestation: OnceCell::new(),
        }
    }

    /// Pre-seed the custodian instead of building it from config.
    pub fn with_custodian(self, custodian: Arc<dyn KeyCustodian>) -> Self {
        let _ = self.custodian.set(Some(custodian));
        self
    }

    /// Pre-seed the attestation service instead of building it from config.
    pub fn with_attestation(self, attestation: Arc<dyn AttestationService>) -> Self {
        let _ = self.attestation.set(attestation);
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// The configured custodian, if any. Built on first use.
    pub async fn custodian(&self) -> Result<Option<Arc<dyn KeyCustodian>>> {
        self.custodian
            .get_or_try_init(|| async { custody::from_config(&self.config.custodian) })
            .await
            .cloned()
    }

    /// The configured custodian, or a configuration error if there is none.
    pub async fn require_custodian(&self) -> Result<Arc<dyn KeyCustodian>> {
        self.custodian().await?.ok_or_else(|| {
            VaultError::Config("custodian.kind = \"none\": no key custodian available".to_string())
        })
    }

    /// The configured attestation service. Built on first use.
    pub async fn attestation(&self) -> Result<Arc<dyn AttestationService>> {
        self.attestation
            .get_or_try_init(|| async { self.build_attestation() })
            .await
            .cloned()
    }

    fn build_attestation(&self) -> Result<Arc<dyn AttestationService>> {
        let config = &self.config.attestation;
        match config.kind {
            AttestationKind::Simulated => {
                tracing::warn!("Using simulated attestation; not for production use");
                Ok(Arc::new(SimulatedAttestationService::new(
                    config.simulated_claims.clone(),
                    config.simulated_tcb_level,
                )))
            }
            AttestationKind::Http => {
                let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                    VaultError::Config("http attestation requires attestation.endpoint".to_string())
                })?;
                tracing::info!(endpoint, "Using remote attestation service");
                Ok(Arc::new(HttpAttestationService::new(
                    endpoint,
                    self.config.attestation_timeout(),
                )?))
            }
        }
    }

    /// Probe for TEE detection: a fixed simulated environment when
    /// configured, otherwise the real filesystem.
    pub fn probe(&self) -> Arc<dyn EnvironmentProbe> {
        match self.config.attestation.simulated_environment {
            Some(kind) if self.config.attestation.kind == AttestationKind::Simulated => {
                Arc::new(StaticProbe::for_environment(kind))
            }
            _ => Arc::new(SystemProbe),
        }
    }

    /// A gate over the configured policy, attestation service and custodian.
    pub async fn gate(&self) -> Result<KeyReleaseGate> {
        let mut gate = self.attestation_gate().await?;
        if let Some(custodian) = self.custodian().await? {
            gate = gate.with_custodian(custodian);
        }
        Ok(gate)
    }

    /// A gate that can authorize but never release keys.
    async fn attestation_gate(&self) -> Result<KeyReleaseGate> {
        let policy = PolicyDocument::load(&self.config.attestation.policy_path)?;
        Ok(KeyReleaseGate::new(policy, self.attestation().await?)
            .with_timeout(self.config.attestation_timeout()))
    }

    pub async fn engine(&self) -> Result<EnvelopeCryptoEngine> {
        Ok(EnvelopeCryptoEngine::new(self.require_custodian().await?)
            .with_timeout(self.config.custodian_timeout()))
    }

    /// A materializer using the passthrough loader and the configured
    /// storage and retention settings.
    pub async fn materializer(&self) -> Result<ModelMaterializer<PassthroughLoader>> {
        let engine = Arc::new(self.engine().await?);
        let gate = Arc::new(self.gate().await?);
        let scratch = ScratchDir::create(&self.config.storage.scratch_dir)?;
        Ok(ModelMaterializer::new(
            engine,
            gate,
            self.probe(),
            Arc::new(PassthroughLoader::new()),
            scratch,
        )
        .with_artifact_dir(&self.config.storage.artifact_dir)
        .with_bounds(RetentionBounds {
            max_models: self.config.cache.max_cached_models,
            idle_ttl: self.config.cache.idle_ttl(),
        }))
    }

    /// The standard six-check readiness probe.
    ///
    /// Collaborators that fail to build turn into failing checks rather
    /// than errors, so the report stays complete.
    pub async fn readiness(&self) -> ReadinessAggregator {
        let readiness = &self.config.readiness;
        let mut aggregator = ReadinessAggregator::new(self.config.readiness_timeout())
            .with_summary(self.summary());

        aggregator = if !readiness.attestation_required {
            aggregator.with_check(AttestationCheck::not_required())
        } else {
            match self.attestation_gate().await {
                Ok(gate) => {
                    aggregator.with_check(AttestationCheck::new(Arc::new(gate), self.probe()))
                }
                Err(e) => aggregator.with_check(UnavailableCheck::new("attestation", e)),
            }
        };

        aggregator = if !readiness.custodian_check {
            aggregator.with_check(CustodianCheck::new(None, &self.config.custodian.key_ref))
        } else {
            match self.custodian().await {
                Ok(custodian) => aggregator.with_check(CustodianCheck::new(
                    custodian,
                    &self.config.custodian.key_ref,
                )),
                Err(e) => aggregator.with_check(UnavailableCheck::new("custodian", e)),
            }
        };

        aggregator
            .with_check(if readiness.model_check {
                ModelsCheck::new(&self.config.storage.artifact_dir)
            } else {
                ModelsCheck::disabled()
            })
            .with_check(ResourcesCheck::new(
                &self.config.storage.artifact_dir,
                readiness.min_free_disk_mb,
                readiness.min_available_memory_mb,
            ))
            .with_check(if readiness.port_check {
                PortCheck::new(readiness.service_port)
            } else {
                PortCheck::disabled()
            })
            .with_check(if readiness.liveness_check {
                LivenessCheck::new(readiness.service_port, &readiness.liveness_path)
            } else {
                LivenessCheck::disabled()
            })
    }

    fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            artifact_dir: self.config.storage.artifact_dir.clone(),
            service_port: self.config.readiness.service_port,
            attestation_required: self.config.readiness.attestation_required,
            custodian: format!("{:?}", self.config.custodian.kind).to_lowercase(),
            attestation: format!("{:?}", self.config.attestation.kind).to_lowercase(),
        }
    }
}

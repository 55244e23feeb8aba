//! TEE presence detection.
//!
//! Detection is an ordered list of rules evaluated against an
//! [`EnvironmentProbe`]; the first rule whose predicate matches wins. The
//! probe is a trait so the rules can be exercised without real devices.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::tee::attestation::EnvironmentKind;

const SGX_ENCLAVE_DEVICES: [&str; 2] = ["/dev/sgx_enclave", "/dev/sgx/enclave"];
const SGX_PROVISION_DEVICE: &str = "/dev/sgx_provision";
const SEV_GUEST_DEVICE: &str = "/dev/sev-guest";
const SEV_DEVICE: &str = "/dev/sev";
const SEV_SNP_FLAG: &str = "/sys/module/kvm_amd/parameters/sev_snp";
const TDX_MARKERS: [&str; 3] = ["/dev/tdx_guest", "/dev/tdx-guest", "/sys/firmware/tdx_seam"];

/// Read-only view of the host used by detection rules.
pub trait EnvironmentProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> Option<String>;
}

/// Probe backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl EnvironmentProbe for SystemProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

/// Probe answering from a fixed set of paths and file contents.
///
/// Used for simulated environments and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticProbe {
    present: BTreeSet<PathBuf>,
    contents: BTreeMap<PathBuf, String>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.present.insert(path.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        self.present.insert(path.clone());
        self.contents.insert(path, content.into());
        self
    }

    /// A probe that looks like the given environment to the default rules.
    pub fn for_environment(kind: EnvironmentKind) -> Self {
        match kind {
            EnvironmentKind::Sgx => Self::new()
                .with_path(SGX_ENCLAVE_DEVICES[0])
                .with_path(SGX_PROVISION_DEVICE),
            EnvironmentKind::SevSnp => Self::new().with_path(SEV_GUEST_DEVICE),
            EnvironmentKind::Tdx => Self::new().with_path(TDX_MARKERS[0]),
            EnvironmentKind::None => Self::new(),
        }
    }
}

impl EnvironmentProbe for StaticProbe {
    fn exists(&self, path: &Path) -> bool {
        self.present.contains(path)
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        self.contents.get(path).cloned()
    }
}

/// Outcome of running the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: EnvironmentKind,
    pub details: BTreeMap<String, String>,
}

impl Detection {
    pub fn none() -> Self {
        Self {
            kind: EnvironmentKind::None,
            details: BTreeMap::new(),
        }
    }
}

/// A predicate over the probe paired with a factory for the resulting detection.
pub struct DetectionRule {
    pub kind: EnvironmentKind,
    pub matches: fn(&dyn EnvironmentProbe) -> bool,
    pub describe: fn(&dyn EnvironmentProbe) -> BTreeMap<String, String>,
}

impl std::fmt::Debug for DetectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionRule")
            .field("kind", &self.kind)
            .finish()
    }
}

fn first_existing(probe: &dyn EnvironmentProbe, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|p| probe.exists(Path::new(p)))
        .map(|p| p.to_string())
}

fn sgx_matches(probe: &dyn EnvironmentProbe) -> bool {
    first_existing(probe, &SGX_ENCLAVE_DEVICES).is_some()
}

fn sgx_describe(probe: &dyn EnvironmentProbe) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    if let Some(device) = first_existing(probe, &SGX_ENCLAVE_DEVICES) {
        details.insert("device".to_string(), device);
    }
    let dcap = probe.exists(Path::new(SGX_PROVISION_DEVICE));
    details.insert("dcap".to_string(), dcap.to_string());
    details
}

fn sev_snp_flag_enabled(probe: &dyn EnvironmentProbe) -> bool {
    probe
        .read_to_string(Path::new(SEV_SNP_FLAG))
        .map(|v| v.trim().eq_ignore_ascii_case("y") || v.trim() == "1")
        .unwrap_or(false)
}

fn sev_snp_matches(probe: &dyn EnvironmentProbe) -> bool {
    probe.exists(Path::new(SEV_GUEST_DEVICE))
        || (probe.exists(Path::new(SEV_DEVICE)) && sev_snp_flag_enabled(probe))
}

fn sev_snp_describe(probe: &dyn EnvironmentProbe) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    let device = if probe.exists(Path::new(SEV_GUEST_DEVICE)) {
        SEV_GUEST_DEVICE
    } else {
        SEV_DEVICE
    };
    details.insert("device".to_string(), device.to_string());
    details.insert(
        "snp_enabled".to_string(),
        sev_snp_flag_enabled(probe).to_string(),
    );
    details
}

fn tdx_matches(probe: &dyn EnvironmentProbe) -> bool {
    first_existing(probe, &TDX_MARKERS).is_some()
}

fn tdx_describe(probe: &dyn EnvironmentProbe) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    if let Some(marker) = first_existing(probe, &TDX_MARKERS) {
        details.insert("device".to_string(), marker);
    }
    details
}

/// The built-in rules in priority order: SGX, then SEV-SNP, then TDX.
pub fn default_rules() -> Vec<DetectionRule> {
    vec![
        DetectionRule {
            kind: EnvironmentKind::Sgx,
            matches: sgx_matches,
            describe: sgx_describe,
        },
        DetectionRule {
            kind: EnvironmentKind::SevSnp,
            matches: sev_snp_matches,
            describe: sev_snp_describe,
        },
        DetectionRule {
            kind: EnvironmentKind::Tdx,
            matches: tdx_matches,
            describe: tdx_describe,
        },
    ]
}

/// Evaluate `rules` in order; the first match wins.
pub fn detect(probe: &dyn EnvironmentProbe, rules: &[DetectionRule]) -> Detection {
    for rule in rules {
        if (rule.matches)(probe) {
            let details = (rule.describe)(probe);
            tracing::debug!(tee = %rule.kind, ?details, "TEE environment detected");
            return Detection {
                kind: rule.kind,
                details,
            };
        }
    }
    tracing::debug!("No TEE environment detected");
    Detection::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_probe_detects_none() {
        let detection = detect(&StaticProbe::new(), &default_rules());
        assert_eq!(detection.kind, EnvironmentKind::None);
        assert!(detection.details.is_empty());
    }

    #[test]
    fn test_sgx_wins_over_tdx() {
        let probe = StaticProbe::new()
            .with_path("/dev/sgx/enclave")
            .with_path("/dev/tdx_guest");
        let detection = detect(&probe, &default_rules());
        assert_eq!(detection.kind, EnvironmentKind::Sgx);
        assert_eq!(detection.details["device"], "/dev/sgx/enclave");
        assert_eq!(detection.details["dcap"], "false");
    }

    #[test]
    fn test_sev_snp_wins_over_tdx() {
        let probe = StaticProbe::new()
            .with_path("/dev/sev-guest")
            .with_path("/sys/firmware/tdx_seam");
        assert_eq!(
            detect(&probe, &default_rules()).kind,
            EnvironmentKind::SevSnp
        );
    }

    #[test]
    fn test_sev_without_snp_flag_is_not_snp() {
        let probe = StaticProbe::new()
            .with_path("/dev/sev")
            .with_file("/sys/module/kvm_amd/parameters/sev_snp", "N\n");
        assert_eq!(detect(&probe, &default_rules()).kind, EnvironmentKind::None);
    }

    #[test]
    fn test_sev_with_snp_flag() {
        let probe = StaticProbe::new()
            .with_path("/dev/sev")
            .with_file("/sys/module/kvm_amd/parameters/sev_snp", "Y\n");
        let detection = detect(&probe, &default_rules());
        assert_eq!(detection.kind, EnvironmentKind::SevSnp);
        assert_eq!(detection.details["device"], "/dev/sev");
        assert_eq!(detection.details["snp_enabled"], "true");
    }

    #[test]
    fn test_tdx_seam_marker() {
        let probe = StaticProbe::new().with_path("/sys/firmware/tdx_seam");
        let detection = detect(&probe, &default_rules());
        assert_eq!(detection.kind, EnvironmentKind::Tdx);
        assert_eq!(detection.details["device"], "/sys/firmware/tdx_seam");
    }

    #[test]
    fn test_for_environment_matches_default_rules() {
        for kind in [
            EnvironmentKind::Sgx,
            EnvironmentKind::SevSnp,
            EnvironmentKind::Tdx,
            EnvironmentKind::None,
        ] {
            let probe = StaticProbe::for_environment(kind);
            assert_eq!(detect(&probe, &default_rules()).kind, kind);
        }
    }

    #[test]
    fn test_custom_rule_order_is_respected() {
        let mut rules = default_rules();
        rules.reverse();
        let probe = StaticProbe::new()
            .with_path("/dev/sgx_enclave")
            .with_path("/dev/tdx-guest");
        assert_eq!(detect(&probe, &rules).kind, EnvironmentKind::Tdx);
    }
}

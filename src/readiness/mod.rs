//! Readiness probing.
//!
//! The aggregator runs a fixed, ordered list of independent checks. Each
//! check is bounded by a timeout and isolated from panics, so the report is
//! always complete. The service is ready iff no check failed; skipped
//! checks never block readiness.

pub mod checks;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckOutcome::Pass => write!(f, "pass"),
            CheckOutcome::Fail => write!(f, "fail"),
            CheckOutcome::Skip => write!(f, "skip"),
        }
    }
}

/// What a single check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStatus {
    pub outcome: CheckOutcome,
    pub detail: String,
}

impl CheckStatus {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Pass,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Fail,
            detail: detail.into(),
        }
    }

    pub fn skip(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Skip,
            detail: detail.into(),
        }
    }
}

/// One readiness check. Implementations report failures as a `Fail`
/// status; errors never escape.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> CheckStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
    pub detail: String,
    pub duration_ms: u64,
}

/// Configuration echoed into the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub artifact_dir: PathBuf,
    pub service_port: u16,
    pub attestation_required: bool,
    pub custodian: String,
    pub attestation: String,
}

/// Outcome of one probe run. Built fresh every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<CheckResult>,
    pub config: ConfigSummary,
}

impl ReadinessReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Process exit code for probe tooling: 0 ready, 1 not ready.
    pub fn exit_code(&self) -> i32 {
        if self.ready {
            0
        } else {
            1
        }
    }
}

pub struct ReadinessAggregator {
    checks: Vec<Box<dyn ReadinessCheck>>,
    timeout: Duration,
    summary: ConfigSummary,
}

impl std::fmt::Debug for ReadinessAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.checks.iter().map(|c| c.name()).collect();
        f.debug_struct("ReadinessAggregator")
            .field("checks", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ReadinessAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            timeout,
            summary: ConfigSummary::default(),
        }
    }

    /// Append a check. Checks are reported in the order they were added.
    pub fn with_check(mut self, check: impl ReadinessCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn with_summary(mut self, summary: ConfigSummary) -> Self {
        self.summary = summary;
        self
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check concurrently and assemble the report.
    pub async fn run(&self) -> ReadinessReport {
        let runs = self
            .checks
            .iter()
            .map(|check| run_isolated(check.as_ref(), self.timeout));
        let checks = futures::future::join_all(runs).await;

        let ready = checks.iter().all(|c| c.outcome != CheckOutcome::Fail);
        for check in &checks {
            match check.outcome {
                CheckOutcome::Fail => {
                    tracing::warn!(check = %check.name, detail = %check.detail, "Readiness check failed")
                }
                _ => tracing::debug!(
                    check = %check.name,
                    outcome = %check.outcome,
                    detail = %check.detail,
                    "Readiness check finished"
                ),
            }
        }
        tracing::info!(ready, "Readiness probe finished");

        ReadinessReport {
            ready,
            timestamp: chrono::Utc::now(),
            checks,
            config: self.summary.clone(),
        }
    }
}

async fn run_isolated(check: &dyn ReadinessCheck, timeout: Duration) -> CheckResult {
    let started = Instant::now();
    let status = match tokio::time::timeout(timeout, AssertUnwindSafe(check.run()).catch_unwind())
        .await
    {
        Ok(Ok(status)) => status,
        Ok(Err(panic)) => CheckStatus::fail(format!("check panicked: {}", panic_message(&panic))),
        Err(_) => CheckStatus::fail(format!("timed out after {}s", timeout.as_secs())),
    };
    CheckResult {
        name: check.name().to_string(),
        outcome: status.outcome,
        detail: status.detail,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

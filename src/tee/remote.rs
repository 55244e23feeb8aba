use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::error::{Result, VaultError};
use crate::tee::attestation::{AttestationService, EnvironmentKind};

#[derive(Debug, Deserialize)]
struct EvidenceResponse {
    evidence: String,
}

#[derive(Debug, Deserialize)]
struct AttestResponse {
    #[serde(default)]
    claims: BTreeMap<String, serde_json::Value>,
}

/// Client for a remote attestation service.
///
/// - `GET {endpoint}/evidence/{kind}` returns `{"evidence": <base64>}`
/// - `POST {endpoint}/attest` with the token as bearer returns `{"claims": {...}}`
///
/// Claim values of any JSON type are flattened to strings.
#[derive(Debug, Clone)]
pub struct HttpAttestationService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAttestationService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

fn claim_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl AttestationService for HttpAttestationService {
    async fn collect_evidence(&self, kind: EnvironmentKind) -> Result<Vec<u8>> {
        let url = format!("{}/evidence/{}", self.endpoint, kind);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VaultError::Transport(format!("evidence request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::Transport(format!(
                "evidence request failed ({status}): {text}"
            )));
        }
        let body: EvidenceResponse = response
            .json()
            .await
            .map_err(|e| VaultError::Transport(format!("unreadable evidence response: {e}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(body.evidence)
            .map_err(|e| VaultError::Transport(format!("evidence is not base64: {e}")))
    }

    async fn verify_remote(&self, token: &str) -> Result<BTreeMap<String, String>> {
        let url = format!("{}/attest", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| VaultError::Transport(format!("attestation request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::InvalidToken(format!("({status}) {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::Transport(format!(
                "attestation failed ({status}): {text}"
            )));
        }

        let body: AttestResponse = response
            .json()
            .await
            .map_err(|e| VaultError::Transport(format!("unreadable attestation response: {e}")))?;
        Ok(body
            .claims
            .into_iter()
            .map(|(k, v)| (k, claim_to_string(v)))
            .collect())
    }

    fn service_name(&self) -> &str {
        "http"
    }
}

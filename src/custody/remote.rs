use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::custody::{KeyCustodian, WRAP_ALGORITHM};
use crate::error::{Result, VaultError};

const API_VERSION: &str = "7.4";

#[derive(Debug, Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct KeyOperationResponse {
    value: String,
}

/// Client for a remote key vault exposing `wrapkey` / `unwrapkey`.
///
/// Values travel base64url-encoded without padding. HTTP 401/403 map to
/// `AccessDenied`, 404 to `NotFound`, everything else to `Transport`.
#[derive(Debug, Clone)]
pub struct HttpKeyCustodian {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpKeyCustodian {
    pub fn new(base_url: &str, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            client,
        })
    }

    fn key_url(&self, key_ref: &str, operation: Option<&str>) -> String {
        match operation {
            Some(op) => format!(
                "{}/keys/{}/{}?api-version={}",
                self.base_url, key_ref, op, API_VERSION
            ),
            None => format!("{}/keys/{}?api-version={}", self.base_url, key_ref, API_VERSION),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn key_operation(&self, key_ref: &str, operation: &str, input: &[u8]) -> Result<Vec<u8>> {
        let body = KeyOperationRequest {
            alg: WRAP_ALGORITHM,
            value: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input),
        };
        let response = self
            .authorized(self.client.post(self.key_url(key_ref, Some(operation))))
            .json(&body)
            .send()
            .await
            .map_err(|e| VaultError::Transport(format!("{operation} request failed: {e}")))?;

        let response = check_status(response, key_ref, operation).await?;
        let parsed: KeyOperationResponse = response.json().await.map_err(|e| {
            VaultError::Transport(format!("{operation} returned an unreadable body: {e}"))
        })?;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(parsed.value.trim_end_matches('='))
            .map_err(|e| VaultError::Transport(format!("{operation} returned invalid base64: {e}")))
    }
}

async fn check_status(
    response: reqwest::Response,
    key_ref: &str,
    operation: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(map_status(status.as_u16(), key_ref, operation, &text))
}

fn map_status(status: u16, key_ref: &str, operation: &str, body: &str) -> VaultError {
    match status {
        401 | 403 => VaultError::AccessDenied(format!(
            "{operation} on key '{key_ref}' refused ({status}): {body}"
        )),
        404 => VaultError::NotFound(format!("custodian key '{key_ref}' does not exist")),
        _ => VaultError::Transport(format!(
            "{operation} on key '{key_ref}' failed ({status}): {body}"
        )),
    }
}

#[async_trait]
impl KeyCustodian for HttpKeyCustodian {
    async fn wrap(&self, key_ref: &str, key: &[u8]) -> Result<Vec<u8>> {
        self.key_operation(key_ref, "wrapkey", key).await
    }

    async fn unwrap(&self, key_ref: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.key_operation(key_ref, "unwrapkey", wrapped)
            .await
            .map(Zeroizing::new)
    }

    async fn health_check(&self, key_ref: &str) -> Result<()> {
        let response = self
            .authorized(self.client.get(self.key_url(key_ref, None)))
            .send()
            .await
            .map_err(|e| VaultError::Transport(format!("key lookup failed: {e}")))?;
        check_status(response, key_ref, "get key").await.map(|_| ())
    }

    fn custodian_name(&self) -> &str {
        "http"
    }
}

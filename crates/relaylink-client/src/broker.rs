//! HTTP access to the broker's credential-issuance endpoints.
//!
//! Every endpoint takes a form-encoded POST and answers `{"s": status, "v": payload}`;
//! `v` is the only field callers care about.

use relaylink_common::CredentialError;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const ICE_ENDPOINT: &str = "getice.php";
pub const TOKEN_ENDPOINT: &str = "gettoken.php";
pub const HOST_ENDPOINT: &str = "gethost.php";

#[derive(Clone, Debug)]
pub struct BrokerClient {
    http: Client,
    base_url: String,
}

impl BrokerClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        insecure_tls: bool,
    ) -> Result<Self, CredentialError> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| CredentialError::Transport {
                endpoint: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POSTs `form` to `{base}/{endpoint}` and returns the `v` payload.
    pub async fn call(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<Value, CredentialError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(%url, "calling broker");

        let res = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| CredentialError::Transport {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(CredentialError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = res
            .json()
            .await
            .map_err(|e| CredentialError::malformed(endpoint, e))?;
        unwrap_payload(endpoint, body)
    }
}

/// Extracts `v` from a broker response body, mapping the broker's error shape.
pub fn unwrap_payload(endpoint: &str, mut body: Value) -> Result<Value, CredentialError> {
    if body.get("s").and_then(Value::as_str) == Some("error") {
        let message = match body.get("v") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unspecified broker error".to_string(),
        };
        return Err(CredentialError::Broker {
            endpoint: endpoint.to_string(),
            message,
        });
    }

    match body.get_mut("v").map(Value::take) {
        None | Some(Value::Null) => Err(CredentialError::malformed(endpoint, "missing `v` field")),
        Some(v) => Ok(v),
    }
}

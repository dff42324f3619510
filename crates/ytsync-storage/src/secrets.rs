//! Secret lookup: process environment or GCP Secret Manager.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::gcp::{AccessTokenSource, AuthError};

const SECRET_MANAGER_BASE_URL: &str = "https://secretmanager.googleapis.com";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {id}: request failed: {source}")]
    Request {
        id: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("secret {id}: http status {status}")]
    HttpStatus { id: String, status: u16 },
    #[error("secret {id}: payload is not valid base64/utf-8")]
    Payload { id: String },
    #[error("invalid secret manager url for {0}")]
    Url(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[async_trait]
pub trait SecretSource: Send + Sync {
    fn describe(&self) -> &'static str;

    /// `Ok(None)` when the secret does not exist.
    async fn secret(&self, id: &str) -> Result<Option<String>, SecretError>;
}

/// Reads secrets from process environment variables of the same name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

#[async_trait]
impl SecretSource for EnvSecretSource {
    fn describe(&self) -> &'static str {
        "environment"
    }

    async fn secret(&self, id: &str) -> Result<Option<String>, SecretError> {
        Ok(std::env::var(id).ok().filter(|v| !v.trim().is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    data: String,
}

/// Reads the latest version of each secret from GCP Secret Manager.
pub struct SecretManagerSource {
    client: reqwest::Client,
    project_id: String,
    base_url: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl SecretManagerSource {
    pub fn new(
        client: reqwest::Client,
        project_id: impl Into<String>,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            base_url: SECRET_MANAGER_BASE_URL.to_string(),
            tokens,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn access_url(&self, id: &str) -> Result<Url, SecretError> {
        let mut url = Url::parse(&self.base_url).map_err(|_| SecretError::Url(id.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SecretError::Url(id.to_string()))?
            .pop_if_empty()
            .extend([
                "v1",
                "projects",
                self.project_id.as_str(),
                "secrets",
                id,
                "versions",
                "latest:access",
            ]);
        Ok(url)
    }
}

fn decode_payload(id: &str, body: &[u8]) -> Result<String, SecretError> {
    let payload_err = || SecretError::Payload { id: id.to_string() };
    let parsed: AccessSecretVersionResponse =
        serde_json::from_slice(body).map_err(|_| payload_err())?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(parsed.payload.data.as_bytes())
        .map_err(|_| payload_err())?;
    String::from_utf8(raw).map_err(|_| payload_err())
}

#[async_trait]
impl SecretSource for SecretManagerSource {
    fn describe(&self) -> &'static str {
        "secret-manager"
    }

    async fn secret(&self, id: &str) -> Result<Option<String>, SecretError> {
        let url = self.access_url(id)?;
        let token = self.tokens.access_token().await?;
        let request_err = |source| SecretError::Request {
            id: id.to_string(),
            source,
        };

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_err)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = resp.bytes().await.map_err(request_err)?;
                decode_payload(id, &body).map(Some)
            }
            status => Err(SecretError::HttpStatus {
                id: id.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

//! OAuth access tokens for Google Cloud APIs.
//!
//! On Cloud Run / GCE the metadata server hands out tokens for the attached
//! service account; elsewhere a token can be injected through `GCP_ACCESS_TOKEN`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("metadata token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata server returned http status {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

/// A fixed bearer token.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Fetches and caches service-account tokens from the GCE metadata server.
pub struct MetadataServerToken {
    client: reqwest::Client,
    url: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl MetadataServerToken {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: METADATA_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AccessTokenSource for MetadataServerToken {
    async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, valid_until)) = cached.as_ref() {
            if Instant::now() < *valid_until {
                return Ok(token.clone());
            }
        }

        let resp = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::HttpStatus(status.as_u16()));
        }
        let token: MetadataToken = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_SLACK);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }
}

/// `GCP_ACCESS_TOKEN` if set, otherwise the metadata server.
pub fn token_source_from_env(client: reqwest::Client) -> Arc<dyn AccessTokenSource> {
    match std::env::var("GCP_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Arc::new(StaticToken::new(token.trim())),
        _ => Arc::new(MetadataServerToken::new(client)),
    }
}

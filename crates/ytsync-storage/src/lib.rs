//! Snapshot object storage + HTTP fetch utilities for ytsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod gcp;
pub mod secrets;

pub use gcp::{AccessTokenSource, AuthError};

pub const CRATE_NAME: &str = "ytsync-storage";

const GCS_BASE_URL: &str = "https://storage.googleapis.com";
const SNAPSHOT_CONTENT_TYPE: &str = "text/csv";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub name: String,
    pub location: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("invalid snapshot name {0:?}")]
    InvalidName(String),
    #[error("snapshot {name} not found in {location}")]
    NotFound { name: String, location: String },
    #[error("snapshot {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {name}: http status {status}")]
    HttpStatus { name: String, status: u16 },
    #[error("snapshot {name}: {source}")]
    Request {
        name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Flat, name-keyed object storage for CSV snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn describe(&self) -> String;

    async fn put(&self, name: &str, bytes: &[u8]) -> Result<StoredSnapshot, SnapshotStoreError>;

    async fn get(&self, name: &str) -> Result<Vec<u8>, SnapshotStoreError>;
}

/// Object names live in a flat namespace; anything that would escape it is rejected.
pub fn validate_snapshot_name(name: &str) -> Result<(), SnapshotStoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        Err(SnapshotStoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Snapshot store backed by a local directory (used off-cloud).
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_err(name: &str) -> impl FnOnce(std::io::Error) -> SnapshotStoreError + '_ {
        move |source| SnapshotStoreError::Io {
            name: name.to_string(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    /// Writes through a temp file and an atomic rename so readers never see
    /// a half-written snapshot. An existing snapshot of the same name is replaced.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<StoredSnapshot, SnapshotStoreError> {
        validate_snapshot_name(name)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io_err(name))?;

        let absolute_path = self.root.join(name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(Self::io_err(name))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(name)(err));
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(name)(err));
        }

        Ok(StoredSnapshot {
            name: name.to_string(),
            location: absolute_path.display().to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, SnapshotStoreError> {
        validate_snapshot_name(name)?;
        let path = self.root.join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapshotStoreError::NotFound {
                    name: name.to_string(),
                    location: self.describe(),
                })
            }
            Err(err) => Err(Self::io_err(name)(err)),
        }
    }
}

/// Snapshot store backed by a Google Cloud Storage bucket via the JSON API.
pub struct GcsSnapshotStore {
    client: reqwest::Client,
    bucket: String,
    base_url: String,
    tokens: std::sync::Arc<dyn AccessTokenSource>,
}

impl GcsSnapshotStore {
    pub fn new(
        client: reqwest::Client,
        bucket: impl Into<String>,
        tokens: std::sync::Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            base_url: GCS_BASE_URL.to_string(),
            tokens,
        }
    }

    /// Points the store at another endpoint, e.g. a storage emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn download_url(&self, name: &str) -> Result<Url, SnapshotStoreError> {
        let mut url = self.parse_base(name)?;
        url.path_segments_mut()
            .map_err(|_| SnapshotStoreError::InvalidName(name.to_string()))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", self.bucket.as_str(), "o", name]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    pub fn upload_url(&self, name: &str) -> Result<Url, SnapshotStoreError> {
        let mut url = self.parse_base(name)?;
        url.path_segments_mut()
            .map_err(|_| SnapshotStoreError::InvalidName(name.to_string()))?
            .pop_if_empty()
            .extend(["upload", "storage", "v1", "b", self.bucket.as_str(), "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name);
        Ok(url)
    }

    fn parse_base(&self, name: &str) -> Result<Url, SnapshotStoreError> {
        Url::parse(&self.base_url).map_err(|_| SnapshotStoreError::InvalidName(name.to_string()))
    }

    fn request_err(name: &str) -> impl FnOnce(reqwest::Error) -> SnapshotStoreError + '_ {
        move |source| SnapshotStoreError::Request {
            name: name.to_string(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for GcsSnapshotStore {
    fn describe(&self) -> String {
        format!("gs://{}", self.bucket)
    }

    async fn put(&self, name: &str, bytes: &[u8]) -> Result<StoredSnapshot, SnapshotStoreError> {
        validate_snapshot_name(name)?;
        let url = self.upload_url(name)?;
        let token = self.tokens.access_token().await?;

        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, SNAPSHOT_CONTENT_TYPE)
            .body(bytes.to_vec())
            .send()
            .instrument(info_span!("gcs_upload", bucket = %self.bucket, name))
            .await
            .map_err(Self::request_err(name))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SnapshotStoreError::HttpStatus {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(StoredSnapshot {
            name: name.to_string(),
            location: format!("gs://{}/{}", self.bucket, name),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, SnapshotStoreError> {
        validate_snapshot_name(name)?;
        let url = self.download_url(name)?;
        let token = self.tokens.access_token().await?;

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .instrument(info_span!("gcs_download", bucket = %self.bucket, name))
            .await
            .map_err(Self::request_err(name))?;

        match resp.status() {
            status if status.is_success() => {
                let body = resp.bytes().await.map_err(Self::request_err(name))?;
                Ok(body.to_vec())
            }
            StatusCode::NOT_FOUND => Err(SnapshotStoreError::NotFound {
                name: name.to_string(),
                location: self.describe(),
            }),
            status => Err(SnapshotStoreError::HttpStatus {
                name: name.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent with every request. Credentials placed here must be marked
    /// sensitive so they never show up in `Debug` output.
    pub default_headers: HeaderMap,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: HeaderMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout)
            .default_headers(self.default_headers.clone());
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: Vec<u8>,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let client = config.build_client()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GETs `url`, retrying transient failures with exponential backoff.
    /// Non-success responses keep their body so callers can decode API error payloads.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, path = url.path());
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().path().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn local_store_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = LocalSnapshotStore::new(dir.path().join("Data"));

        let first = store
            .put("Outdoor Boys_channel_data.csv", b"channel_id\nUC1\n")
            .await
            .expect("first put");
        let second = store
            .put("Outdoor Boys_channel_data.csv", b"channel_id\nUC2\n")
            .await
            .expect("second put");

        assert_ne!(first.content_hash, second.content_hash);
        let bytes = store.get("Outdoor Boys_channel_data.csv").await.expect("get");
        assert_eq!(bytes, b"channel_id\nUC2\n");

        let leftovers = std::fs::read_dir(store.root())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn local_store_reports_missing_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = LocalSnapshotStore::new(dir.path());
        let err = store.get("nope_data.csv").await.unwrap_err();
        assert!(matches!(err, SnapshotStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn names_cannot_escape_the_namespace() {
        let dir = tempdir().expect("tempdir");
        let store = LocalSnapshotStore::new(dir.path());
        for name in ["", "..", "../x_data.csv", "a/b_data.csv", "a\\b_data.csv"] {
            let err = store.put(name, b"x").await.unwrap_err();
            assert!(matches!(err, SnapshotStoreError::InvalidName(_)), "{name}");
        }
    }

    #[test]
    fn gcs_urls_encode_object_names() {
        let store = GcsSnapshotStore::new(
            reqwest::Client::new(),
            "my-bucket",
            std::sync::Arc::new(gcp::StaticToken::new("t")),
        );
        let download = store.download_url("I did a thing_channel_data.csv").unwrap();
        assert_eq!(
            download.as_str(),
            "https://storage.googleapis.com/storage/v1/b/my-bucket/o/I%20did%20a%20thing_channel_data.csv?alt=media"
        );
        let upload = store.upload_url("OutdoorBoys_data.csv").unwrap();
        assert_eq!(
            upload.as_str(),
            "https://storage.googleapis.com/upload/storage/v1/b/my-bucket/o?uploadType=media&name=OutdoorBoys_data.csv"
        );
    }

    #[test]
    fn sensitive_default_headers_stay_out_of_debug_output() {
        let mut value = HeaderValue::from_static("super-secret-key");
        value.set_sensitive(true);
        let mut config = HttpClientConfig::default();
        config.default_headers.insert("x-goog-api-key", value);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-key"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    async fn serve_locally(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Answers like the GCS JSON API for a handful of fixed object names.
    fn fake_gcs() -> axum::Router {
        axum::Router::new().fallback(|req: axum::extract::Request| async move {
            let authorized = req
                .headers()
                .get(reqwest::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some("Bearer test-token");
            if !authorized {
                return (StatusCode::UNAUTHORIZED, Vec::new());
            }
            let path = req.uri().path().to_string();
            match (req.method().as_str(), path.as_str()) {
                ("POST", "/upload/storage/v1/b/bucket/o") => (StatusCode::OK, b"{}".to_vec()),
                ("GET", "/storage/v1/b/bucket/o/present_data.csv") => {
                    (StatusCode::OK, b"videoId\n".to_vec())
                }
                ("GET", "/storage/v1/b/bucket/o/locked_data.csv") => {
                    (StatusCode::FORBIDDEN, Vec::new())
                }
                _ => (StatusCode::NOT_FOUND, Vec::new()),
            }
        })
    }

    async fn gcs_store() -> GcsSnapshotStore {
        let base = serve_locally(fake_gcs()).await;
        GcsSnapshotStore::new(
            reqwest::Client::new(),
            "bucket",
            std::sync::Arc::new(gcp::StaticToken::new("test-token")),
        )
        .with_base_url(base)
    }

    #[tokio::test]
    async fn gcs_get_maps_statuses() {
        let store = gcs_store().await;

        assert_eq!(store.get("present_data.csv").await.unwrap(), b"videoId\n");
        assert!(matches!(
            store.get("absent_data.csv").await,
            Err(SnapshotStoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("locked_data.csv").await,
            Err(SnapshotStoreError::HttpStatus { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn gcs_put_reports_bucket_location() {
        let store = gcs_store().await;
        let stored = store.put("fresh_data.csv", b"videoId\n").await.unwrap();
        assert_eq!(stored.location, "gs://bucket/fresh_data.csv");
        assert_eq!(stored.byte_size, 8);
    }
}

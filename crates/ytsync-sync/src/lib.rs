//! Snapshot retrieval, reconciliation and import auditing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use ytsync_storage::gcp::token_source_from_env;
use ytsync_storage::secrets::{EnvSecretSource, SecretManagerSource, SecretSource};
use ytsync_storage::{GcsSnapshotStore, HttpClientConfig, LocalSnapshotStore, SnapshotStore};
use ytsync_youtube::{YouTubeClient, YouTubeConfig};

pub mod audit;
pub mod catalog;
pub mod config;
pub mod pipeline;
pub mod reconcile;
pub mod schedule;

pub use audit::ImportAuditRecorder;
pub use catalog::{Catalog, CatalogError, ImportTaskLog, MemoryCatalog, PgCatalog, UpsertOutcome};
pub use config::{
    load_channel_registry, load_environment, ConfigError, Credentials, DailyTime, DatabaseTarget,
    SecretBackend, SnapshotBackend, SyncConfig,
};
pub use pipeline::{RunFailure, RunReport, RunScope, RunStage, SyncPipeline};
pub use reconcile::{ReconcileCounts, ReconcileError, Reconciler};
pub use schedule::maybe_build_scheduler;

pub const CRATE_NAME: &str = "ytsync-sync";

/// Everything a trigger surface needs, wired from the environment.
pub struct AppContext {
    pub config: SyncConfig,
    pub pipeline: Arc<SyncPipeline>,
    pub catalog: Arc<PgCatalog>,
}

fn http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    }
}

fn secret_source(
    backend: &SecretBackend,
    client: &reqwest::Client,
) -> Arc<dyn SecretSource> {
    match backend {
        SecretBackend::Environment => Arc::new(EnvSecretSource),
        SecretBackend::SecretManager { project_id } => Arc::new(SecretManagerSource::new(
            client.clone(),
            project_id.clone(),
            token_source_from_env(client.clone()),
        )),
    }
}

/// Loads env files, settings and the secret source. Shared by every command.
async fn bootstrap() -> Result<(SyncConfig, Arc<dyn SecretSource>, reqwest::Client)> {
    let root = std::path::PathBuf::from(".");
    let backend = load_environment(&root)?;
    let config = SyncConfig::from_env()?;
    let client = http_config(&config)
        .build_client()
        .context("building http client")?;
    let secrets = secret_source(&backend, &client);
    info!(secrets = secrets.describe(), "configuration loaded");
    Ok((config, secrets, client))
}

/// Connects to Postgres only; for `migrate` and `history`.
pub async fn catalog_from_env() -> Result<PgCatalog> {
    let (_, secrets, _) = bootstrap().await?;
    let target = config::resolve_database(secrets.as_ref()).await?;
    PgCatalog::connect(&target)
        .await
        .context("connecting to postgres")
}

pub async fn context_from_env() -> Result<AppContext> {
    let (config, secrets, client) = bootstrap().await?;
    let credentials = Credentials::resolve(secrets.as_ref(), config.snapshot_backend).await?;
    let channels = load_channel_registry(&config.workspace_root).await?;

    let snapshots: Arc<dyn SnapshotStore> = match (config.snapshot_backend, &credentials.bucket_name) {
        (SnapshotBackend::Gcs, Some(bucket)) => Arc::new(GcsSnapshotStore::new(
            client.clone(),
            bucket.clone(),
            token_source_from_env(client.clone()),
        )),
        _ => Arc::new(LocalSnapshotStore::new(
            config.workspace_root.join(&config.snapshot_dir),
        )),
    };

    let youtube = YouTubeClient::new(
        &credentials.youtube_api_key,
        YouTubeConfig {
            http: http_config(&config),
            ..Default::default()
        },
    )
    .context("building youtube client")?;

    let catalog = Arc::new(
        PgCatalog::connect(&credentials.database)
            .await
            .context("connecting to postgres")?,
    );

    info!(
        channels = channels.len(),
        snapshots = %snapshots.describe(),
        max_pages = ?config.max_pages,
        "sync pipeline ready"
    );
    let pipeline = SyncPipeline::new(
        channels,
        Arc::new(youtube),
        snapshots,
        catalog.clone(),
        catalog.clone(),
    )
    .with_max_pages(config.max_pages);

    Ok(AppContext {
        config,
        pipeline: Arc::new(pipeline),
        catalog,
    })
}

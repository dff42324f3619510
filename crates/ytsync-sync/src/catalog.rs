//! Durable channel/video/import_task storage: Postgres via sqlx, plus an
//! in-memory implementation with the same transactional behaviour.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use ytsync_core::{ChannelRow, ImportTask, RunStatus, VideoRow};

use crate::config::DatabaseTarget;

/// Whether an upsert introduced a new key or overwrote an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("import task row has unknown status {0:?}")]
    BadStatus(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Upserts into the channel and video tables. Each call is one transaction:
/// either every row in the batch is written or none is.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn upsert_channels(
        &self,
        channel_name: &str,
        rows: &[ChannelRow],
    ) -> Result<(), CatalogError>;

    /// Returns one outcome per input row, in input order.
    async fn upsert_videos(&self, rows: &[VideoRow]) -> Result<Vec<UpsertOutcome>, CatalogError>;
}

/// Append-only store for import audit rows.
#[async_trait]
pub trait ImportTaskLog: Send + Sync {
    async fn insert_import_task(&self, task: &ImportTask) -> Result<i64, CatalogError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub channel_id: String,
    pub channel_name: String,
    pub subscriber_count: i64,
    pub video_count: i64,
    pub view_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTaskEntry {
    pub id: i64,
    pub task: ImportTask,
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(target: &DatabaseTarget) -> Result<Self, CatalogError> {
        let options = match target {
            DatabaseTarget::Url(url) => url.parse::<PgConnectOptions>()?,
            DatabaseTarget::Parts {
                user,
                password,
                database,
                host,
                socket_dir,
            } => {
                let mut options = PgConnectOptions::new()
                    .username(user)
                    .password(password)
                    .database(database);
                if let Some(dir) = socket_dir {
                    options = options.socket(dir);
                } else if let Some(host) = host {
                    options = options.host(host);
                }
                options
            }
        };
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), CatalogError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn recent_import_tasks(&self, limit: u32) -> Result<Vec<ImportTaskEntry>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, date_start, date_end, created_videos, updated_videos, status, error_summary
              FROM import_task
             ORDER BY id DESC
             LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = status
                .parse::<RunStatus>()
                .map_err(|_| CatalogError::BadStatus(status.clone()))?;
            out.push(ImportTaskEntry {
                id: row.try_get("id")?,
                task: ImportTask {
                    date_start: row.try_get::<DateTime<Utc>, _>("date_start")?,
                    date_end: row.try_get::<DateTime<Utc>, _>("date_end")?,
                    created_videos: row.try_get("created_videos")?,
                    updated_videos: row.try_get("updated_videos")?,
                    status,
                    error_summary: row.try_get("error_summary")?,
                },
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn upsert_channels(
        &self,
        channel_name: &str,
        rows: &[ChannelRow],
    ) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO channel (channel_id, channel_name, subscriber_count, video_count, view_count)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (channel_id) DO UPDATE SET
                    channel_name = EXCLUDED.channel_name,
                    subscriber_count = EXCLUDED.subscriber_count,
                    video_count = EXCLUDED.video_count,
                    view_count = EXCLUDED.view_count
                "#,
            )
            .bind(&row.channel_id)
            .bind(channel_name)
            .bind(row.subscriber_count)
            .bind(row.video_count)
            .bind(row.view_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `xmax = 0` on the returned tuple means the INSERT branch ran; a row that
    /// went through ON CONFLICT DO UPDATE carries the updating transaction id.
    async fn upsert_videos(&self, rows: &[VideoRow]) -> Result<Vec<UpsertOutcome>, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let inserted: bool = sqlx::query(
                r#"
                INSERT INTO video (video_id, title, description, published_at, likes, views)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (video_id) DO UPDATE SET
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    published_at = EXCLUDED.published_at,
                    likes = EXCLUDED.likes,
                    views = EXCLUDED.views
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(&row.video_id)
            .bind(&row.title)
            .bind(&row.description)
            .bind(row.published_at)
            .bind(row.likes)
            .bind(row.views)
            .fetch_one(&mut *tx)
            .await?
            .try_get("inserted")?;

            outcomes.push(if inserted {
                UpsertOutcome::Created
            } else {
                UpsertOutcome::Updated
            });
        }
        tx.commit().await?;
        Ok(outcomes)
    }
}

#[async_trait]
impl ImportTaskLog for PgCatalog {
    async fn insert_import_task(&self, task: &ImportTask) -> Result<i64, CatalogError> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO import_task (date_start, date_end, created_videos, updated_videos, status, error_summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(task.date_start)
        .bind(task.date_end)
        .bind(task.created_videos)
        .bind(task.updated_videos)
        .bind(task.status.as_str())
        .bind(task.error_summary.as_deref())
        .fetch_one(&self.pool)
        .await?
        .try_get("id")?;
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: BTreeMap<String, ChannelEntry>,
    videos: BTreeMap<String, VideoRow>,
    import_tasks: Vec<ImportTaskEntry>,
    poisoned_video_ids: HashSet<String>,
    fail_import_tasks: bool,
}

/// In-process catalog for dry runs and tests. Batches are applied to a copy
/// and swapped in on success, matching the all-or-nothing transaction
/// behaviour of [`PgCatalog`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any video batch containing `video_id` fails without writing.
    pub async fn poison_video(&self, video_id: impl Into<String>) {
        self.state.lock().await.poisoned_video_ids.insert(video_id.into());
    }

    pub async fn fail_import_tasks(&self, fail: bool) {
        self.state.lock().await.fail_import_tasks = fail;
    }

    pub async fn channel(&self, channel_id: &str) -> Option<ChannelEntry> {
        self.state.lock().await.channels.get(channel_id).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    pub async fn video(&self, video_id: &str) -> Option<VideoRow> {
        self.state.lock().await.videos.get(video_id).cloned()
    }

    pub async fn video_count(&self) -> usize {
        self.state.lock().await.videos.len()
    }

    pub async fn import_tasks(&self) -> Vec<ImportTaskEntry> {
        self.state.lock().await.import_tasks.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn upsert_channels(
        &self,
        channel_name: &str,
        rows: &[ChannelRow],
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        let mut channels = state.channels.clone();
        for row in rows {
            channels.insert(
                row.channel_id.clone(),
                ChannelEntry {
                    channel_id: row.channel_id.clone(),
                    channel_name: channel_name.to_string(),
                    subscriber_count: row.subscriber_count,
                    video_count: row.video_count,
                    view_count: row.view_count,
                },
            );
        }
        state.channels = channels;
        Ok(())
    }

    async fn upsert_videos(&self, rows: &[VideoRow]) -> Result<Vec<UpsertOutcome>, CatalogError> {
        let mut state = self.state.lock().await;
        if let Some(bad) = rows
            .iter()
            .find(|r| state.poisoned_video_ids.contains(&r.video_id))
        {
            return Err(CatalogError::Unavailable(format!(
                "write rejected for video {}",
                bad.video_id
            )));
        }

        let mut videos = state.videos.clone();
        let outcomes = rows
            .iter()
            .map(|row| match videos.insert(row.video_id.clone(), row.clone()) {
                None => UpsertOutcome::Created,
                Some(_) => UpsertOutcome::Updated,
            })
            .collect();
        state.videos = videos;
        Ok(outcomes)
    }
}

#[async_trait]
impl ImportTaskLog for MemoryCatalog {
    async fn insert_import_task(&self, task: &ImportTask) -> Result<i64, CatalogError> {
        let mut state = self.state.lock().await;
        if state.fail_import_tasks {
            return Err(CatalogError::Unavailable("import_task insert rejected".into()));
        }
        let id = state.import_tasks.len() as i64 + 1;
        state.import_tasks.push(ImportTaskEntry {
            id,
            task: task.clone(),
        });
        Ok(id)
    }
}

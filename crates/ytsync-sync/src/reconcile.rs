//! Merges snapshot files into the channel and video tables.

use std::ops::AddAssign;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use ytsync_core::snapshot::{decode_channel_rows, decode_video_rows, snapshot_text, SnapshotError};
use ytsync_core::{ChannelRow, SnapshotKind, SnapshotName, VideoRow};

use crate::catalog::{Catalog, CatalogError, UpsertOutcome};

/// Created/updated video tallies for one snapshot or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub created: i64,
    pub updated: i64,
}

impl ReconcileCounts {
    pub fn new(created: i64, updated: i64) -> Self {
        Self { created, updated }
    }

    fn from_outcomes(outcomes: &[UpsertOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut acc, outcome| {
            match outcome {
                UpsertOutcome::Created => acc.created += 1,
                UpsertOutcome::Updated => acc.updated += 1,
            }
            acc
        })
    }
}

impl AddAssign for ReconcileCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: SnapshotError,
    },
    #[error("{file}: not a channel or video snapshot name")]
    UnknownFile { file: String },
    #[error("{file}: {source}")]
    Database {
        file: String,
        #[source]
        source: CatalogError,
    },
}

pub struct Reconciler {
    catalog: Arc<dyn Catalog>,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Upserts channel rows under `channel_name`. The name in the rows is
    /// ignored; the caller derives it from the snapshot file name.
    pub async fn reconcile_channel_snapshot(
        &self,
        file: &str,
        rows: &[ChannelRow],
        channel_name: &str,
    ) -> Result<(), ReconcileError> {
        self.catalog
            .upsert_channels(channel_name, rows)
            .await
            .map_err(|source| ReconcileError::Database {
                file: file.to_string(),
                source,
            })?;
        info!(file, channel_name, rows = rows.len(), "channel snapshot reconciled");
        Ok(())
    }

    pub async fn reconcile_video_snapshot(
        &self,
        file: &str,
        rows: &[VideoRow],
        channel_name: &str,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let outcomes = self
            .catalog
            .upsert_videos(rows)
            .await
            .map_err(|source| ReconcileError::Database {
                file: file.to_string(),
                source,
            })?;
        let counts = ReconcileCounts::from_outcomes(&outcomes);
        info!(
            file,
            channel_name,
            created = counts.created,
            updated = counts.updated,
            "video snapshot reconciled"
        );
        Ok(counts)
    }

    /// Decodes a downloaded snapshot and reconciles it according to its
    /// file name. Channel snapshots contribute no video counts. Nothing is
    /// written if any row fails to parse.
    pub async fn reconcile_file(
        &self,
        file: &str,
        bytes: &[u8],
    ) -> Result<ReconcileCounts, ReconcileError> {
        let name = SnapshotName::parse(file).ok_or_else(|| ReconcileError::UnknownFile {
            file: file.to_string(),
        })?;
        let parse_err = |source| ReconcileError::Parse {
            file: file.to_string(),
            source,
        };
        let text = snapshot_text(bytes).map_err(parse_err)?;
        debug!(file, bytes = bytes.len(), "decoding snapshot");

        match name.kind {
            SnapshotKind::Channel => {
                let rows = decode_channel_rows(text).map_err(parse_err)?;
                self.reconcile_channel_snapshot(file, &rows, &name.channel_name)
                    .await?;
                Ok(ReconcileCounts::default())
            }
            SnapshotKind::Video => {
                let rows = decode_video_rows(text).map_err(parse_err)?;
                self.reconcile_video_snapshot(file, &rows, &name.channel_name)
                    .await
            }
        }
    }
}

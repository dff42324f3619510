//! Core domain model for ytsync: channel/video records, import audit rows and
//! snapshot naming.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod snapshot;

pub const CRATE_NAME: &str = "ytsync-core";

pub const VIDEO_SNAPSHOT_SUFFIX: &str = "_data.csv";
pub const CHANNEL_SNAPSHOT_SUFFIX: &str = "_channel_data.csv";

/// A channel tracked by the sync pipeline.
///
/// `name` keys the video snapshot (`<name>_data.csv`), `title` is the
/// platform display name and keys the channel snapshot
/// (`<title>_channel_data.csv`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSource {
    pub channel_id: String,
    pub name: String,
    pub title: String,
}

impl ChannelSource {
    pub fn new(
        channel_id: impl Into<String>,
        name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            name: name.into(),
            title: title.into(),
        }
    }

    pub fn video_snapshot_name(&self) -> String {
        format!("{}{VIDEO_SNAPSHOT_SUFFIX}", self.name)
    }

    pub fn channel_snapshot_name(&self) -> String {
        format!("{}{CHANNEL_SNAPSHOT_SUFFIX}", self.title)
    }
}

/// The three channels the pipeline has always tracked.
pub fn builtin_channels() -> Vec<ChannelSource> {
    vec![
        ChannelSource::new("UCfpCQ89W9wjkHc8J_6eTbBg", "OutdoorBoys", "Outdoor Boys"),
        ChannelSource::new("UCHNPI6vNmspHR49e7EnWc_g", "pacificsound3003", "PacificSound3003"),
        ChannelSource::new("UCJLZe_NoiG0hT7QCX_9vmqw", "Ididathing", "I did a thing"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Channel,
    Video,
}

/// A snapshot file name split into its kind and the channel name it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub kind: SnapshotKind,
    pub channel_name: String,
}

impl SnapshotName {
    /// Parses `<name>_channel_data.csv` / `<name>_data.csv`. The channel suffix
    /// is checked first because it also ends in `_data.csv`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (kind, stem) = if let Some(stem) = file_name.strip_suffix(CHANNEL_SNAPSHOT_SUFFIX) {
            (SnapshotKind::Channel, stem)
        } else if let Some(stem) = file_name.strip_suffix(VIDEO_SNAPSHOT_SUFFIX) {
            (SnapshotKind::Video, stem)
        } else {
            return None;
        };
        if stem.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            channel_name: stem.to_string(),
        })
    }
}

/// Channel metadata as returned by the platform API and written to the
/// channel snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub channel_name: String,
    pub description: String,
    pub subscriber_count: i64,
    pub video_count: i64,
    pub view_count: i64,
}

/// Per-video metadata and statistics as written to the video snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    #[serde(rename = "videoId")]
    pub video_id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
    pub likes: i64,
    pub views: i64,
    pub comments: i64,
}

/// The subset of a channel snapshot row that reconciliation persists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelRow {
    pub channel_id: String,
    pub subscriber_count: i64,
    pub video_count: i64,
    pub view_count: i64,
}

/// The subset of a video snapshot row that reconciliation persists.
/// `comments` is read past on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoRow {
    #[serde(rename = "videoId")]
    pub video_id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
    pub likes: i64,
    pub views: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// Immutable audit row written once per pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTask {
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub created_videos: i64,
    pub updated_videos: i64,
    pub status: RunStatus,
    pub error_summary: Option<String>,
}

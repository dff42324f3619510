//! CSV snapshot encoding and decoding.
//!
//! Snapshots are UTF-8 with a leading byte-order mark and always carry a
//! header row, even when no data rows follow.

use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{ChannelRecord, ChannelRow, VideoRecord, VideoRow};

pub const BOM: &str = "\u{feff}";

pub const CHANNEL_HEADER: [&str; 6] = [
    "channel_id",
    "channel_name",
    "description",
    "subscriber_count",
    "video_count",
    "view_count",
];

pub const VIDEO_HEADER: [&str; 7] = [
    "videoId",
    "title",
    "description",
    "publishedAt",
    "likes",
    "views",
    "comments",
];

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot row {line}: {message}")]
    Row { line: u64, message: String },
    #[error("snapshot is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("writing snapshot: {0}")]
    Write(#[from] csv::Error),
    #[error("flushing snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental writer for a video snapshot, fed page by page.
pub struct VideoSnapshotWriter {
    writer: csv::Writer<Vec<u8>>,
    rows: usize,
}

impl VideoSnapshotWriter {
    pub fn new() -> Result<Self, SnapshotError> {
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(BOM.as_bytes().to_vec());
        writer.write_record(VIDEO_HEADER)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn push(&mut self, record: &VideoRecord) -> Result<(), SnapshotError> {
        self.writer.serialize(record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> Result<Vec<u8>, SnapshotError> {
        self.writer
            .into_inner()
            .map_err(|err| SnapshotError::Io(err.into_error()))
    }
}

pub fn encode_channel_snapshot(records: &[ChannelRecord]) -> Result<Vec<u8>, SnapshotError> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(BOM.as_bytes().to_vec());
    writer.write_record(CHANNEL_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| SnapshotError::Io(err.into_error()))
}

pub fn encode_video_snapshot(records: &[VideoRecord]) -> Result<Vec<u8>, SnapshotError> {
    let mut writer = VideoSnapshotWriter::new()?;
    for record in records {
        writer.push(record)?;
    }
    writer.finish()
}

/// Decodes raw snapshot bytes into text, dropping a leading BOM if present.
pub fn snapshot_text(bytes: &[u8]) -> Result<&str, SnapshotError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(text.strip_prefix(BOM).unwrap_or(text))
}

pub fn decode_channel_rows(text: &str) -> Result<Vec<ChannelRow>, SnapshotError> {
    decode_rows(text)
}

pub fn decode_video_rows(text: &str) -> Result<Vec<VideoRow>, SnapshotError> {
    decode_rows(text)
}

fn decode_rows<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, SnapshotError> {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.deserialize::<T>() {
        let row = result.map_err(|err| SnapshotError::Row {
            line: err.position().map(|p| p.line()).unwrap_or(0),
            message: err.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

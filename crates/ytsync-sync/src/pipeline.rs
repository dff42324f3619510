//! Retrieval and processing runs, each closed by one import_task row.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use ytsync_core::snapshot::{encode_channel_snapshot, VideoSnapshotWriter};
use ytsync_core::{ChannelSource, RunStatus};
use ytsync_storage::SnapshotStore;
use ytsync_youtube::{FetchContext, VideoPager, VideoPlatform};

use crate::audit::ImportAuditRecorder;
use crate::catalog::{Catalog, ImportTaskLog};
use crate::reconcile::{ReconcileCounts, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunScope {
    /// Fetch and upload snapshots, then reconcile them.
    Full,
    Retrieve,
    Process,
}

impl RunScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RunScope::Full => "full",
            RunScope::Retrieve => "retrieve",
            RunScope::Process => "process",
        }
    }

    fn retrieves(self) -> bool {
        matches!(self, RunScope::Full | RunScope::Retrieve)
    }

    fn processes(self) -> bool {
        matches!(self, RunScope::Full | RunScope::Process)
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RunScope::Full),
            "retrieve" => Ok(RunScope::Retrieve),
            "process" => Ok(RunScope::Process),
            other => Err(format!("unknown run scope {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Fetch,
    Encode,
    Upload,
    Download,
    Reconcile,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStage::Fetch => "fetch",
            RunStage::Encode => "encode",
            RunStage::Upload => "upload",
            RunStage::Download => "download",
            RunStage::Reconcile => "reconcile",
        })
    }
}

/// One recorded failure. `target` is a channel id for retrieval stages and
/// a snapshot file name for processing stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub stage: RunStage,
    pub target: String,
    pub message: String,
}

impl RunFailure {
    fn new(stage: RunStage, target: &str, err: impl fmt::Display) -> Self {
        Self {
            stage,
            target: target.to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.stage, self.target, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scope: RunScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: ReconcileCounts,
    pub snapshots_written: usize,
    pub files_reconciled: usize,
    pub failures: Vec<RunFailure>,
    /// `None` when the audit insert itself failed.
    pub import_task_id: Option<i64>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.failures.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }

    pub fn error_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub struct SyncPipeline {
    channels: Vec<ChannelSource>,
    platform: Arc<dyn VideoPlatform>,
    snapshots: Arc<dyn SnapshotStore>,
    reconciler: Reconciler,
    audit: ImportAuditRecorder,
    max_pages: Option<usize>,
}

impl SyncPipeline {
    pub fn new(
        channels: Vec<ChannelSource>,
        platform: Arc<dyn VideoPlatform>,
        snapshots: Arc<dyn SnapshotStore>,
        catalog: Arc<dyn Catalog>,
        import_log: Arc<dyn ImportTaskLog>,
    ) -> Self {
        Self {
            channels,
            platform,
            snapshots,
            reconciler: Reconciler::new(catalog),
            audit: ImportAuditRecorder::new(import_log),
            max_pages: Some(1),
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Never fails: every failure is collected into the report, and exactly
    /// one import_task row is attempted at the end.
    pub async fn run(&self, scope: RunScope) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("import_run", %run_id, scope = scope.as_str());
        self.run_inner(run_id, scope).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, scope: RunScope) -> RunReport {
        let started_at = Utc::now();
        info!(channels = self.channels.len(), "import run started");

        let mut report = RunReport {
            run_id,
            scope,
            started_at,
            finished_at: started_at,
            totals: ReconcileCounts::default(),
            snapshots_written: 0,
            files_reconciled: 0,
            failures: Vec::new(),
            import_task_id: None,
        };

        if scope.retrieves() {
            let ctx = FetchContext { run_id };
            for channel in &self.channels {
                match self.retrieve_channel(ctx, channel).await {
                    Ok(written) => report.snapshots_written += written,
                    Err(failure) => {
                        warn!(
                            stage = %failure.stage,
                            channel_id = %failure.target,
                            error = %failure.message,
                            "channel retrieval failed"
                        );
                        report.failures.push(failure);
                    }
                }
            }
        }

        if scope.processes() {
            for file in self.snapshot_files() {
                match self.process_file(&file).await {
                    Ok(counts) => {
                        report.totals += counts;
                        report.files_reconciled += 1;
                    }
                    Err(failure) => {
                        warn!(
                            stage = %failure.stage,
                            file = %failure.target,
                            error = %failure.message,
                            "snapshot processing failed"
                        );
                        report.failures.push(failure);
                    }
                }
            }
        }

        report.finished_at = Utc::now();
        report.import_task_id = self
            .audit
            .record_run(
                report.started_at,
                report.finished_at,
                report.totals,
                report.status(),
                report.error_summary(),
            )
            .await;

        info!(
            status = %report.status(),
            created = report.totals.created,
            updated = report.totals.updated,
            snapshots_written = report.snapshots_written,
            files_reconciled = report.files_reconciled,
            failures = report.failures.len(),
            "import run finished"
        );
        report
    }

    /// Both snapshots are fetched and encoded before anything is uploaded,
    /// so an API failure leaves the previous snapshots in place.
    async fn retrieve_channel(
        &self,
        ctx: FetchContext,
        channel: &ChannelSource,
    ) -> Result<usize, RunFailure> {
        let id = channel.channel_id.as_str();
        let fetch_err = |err| RunFailure::new(RunStage::Fetch, id, err);

        let record = self
            .platform
            .fetch_channel_snapshot(&ctx, id)
            .await
            .map_err(fetch_err)?;
        if record.is_none() {
            warn!(channel_id = id, "platform returned no channel; writing empty channel snapshot");
        }
        let encode_err = |err| RunFailure::new(RunStage::Encode, id, err);
        let mut pager = VideoPager::new(self.platform.as_ref(), ctx, id, self.max_pages);
        let mut writer = VideoSnapshotWriter::new().map_err(encode_err)?;
        while let Some(page) = pager.next_page().await.map_err(fetch_err)? {
            for video in &page {
                writer.push(video).map_err(encode_err)?;
            }
        }
        let videos = writer.rows();
        let pages = pager.pages_fetched();

        let channel_csv = encode_channel_snapshot(record.as_slice()).map_err(encode_err)?;
        let video_csv = writer.finish().map_err(encode_err)?;

        let uploads = [
            (channel.channel_snapshot_name(), channel_csv),
            (channel.video_snapshot_name(), video_csv),
        ];
        for (name, bytes) in &uploads {
            let stored = self
                .snapshots
                .put(name, bytes)
                .await
                .map_err(|err| RunFailure::new(RunStage::Upload, id, err))?;
            info!(
                channel_id = id,
                snapshot = %stored.name,
                location = %stored.location,
                bytes = stored.byte_size,
                "snapshot stored"
            );
        }
        info!(channel_id = id, videos, pages, "channel retrieved");
        Ok(uploads.len())
    }

    async fn process_file(&self, file: &str) -> Result<ReconcileCounts, RunFailure> {
        let bytes = self
            .snapshots
            .get(file)
            .await
            .map_err(|err| RunFailure::new(RunStage::Download, file, err))?;
        self.reconciler
            .reconcile_file(file, &bytes)
            .await
            .map_err(|err| RunFailure::new(RunStage::Reconcile, file, err))
    }

    /// Channel snapshots first, then video snapshots, each in registry order.
    fn snapshot_files(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(ChannelSource::channel_snapshot_name)
            .chain(self.channels.iter().map(ChannelSource::video_snapshot_name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use ytsync_core::{ChannelRecord, VideoRecord};
    use ytsync_storage::{LocalSnapshotStore, SnapshotStoreError, StoredSnapshot};
    use ytsync_youtube::{VideoPage, YouTubeError};

    use crate::catalog::MemoryCatalog;

    #[derive(Default)]
    struct FakePlatform {
        failing: HashSet<String>,
        likes: i64,
    }

    #[async_trait]
    impl VideoPlatform for FakePlatform {
        async fn fetch_channel_snapshot(
            &self,
            _ctx: &FetchContext,
            channel_id: &str,
        ) -> Result<Option<ChannelRecord>, YouTubeError> {
            if self.failing.contains(channel_id) {
                return Err(YouTubeError::Api {
                    channel_id: channel_id.to_string(),
                    status: Some(403),
                    message: "quotaExceeded".into(),
                });
            }
            Ok(Some(ChannelRecord {
                channel_id: channel_id.to_string(),
                channel_name: format!("display {channel_id}"),
                description: String::new(),
                subscriber_count: 100,
                video_count: 2,
                view_count: 1000,
            }))
        }

        async fn fetch_video_page(
            &self,
            _ctx: &FetchContext,
            channel_id: &str,
            _page_token: Option<&str>,
        ) -> Result<VideoPage, YouTubeError> {
            let video = |n: u32| VideoRecord {
                video_id: format!("{channel_id}-v{n}"),
                title: format!("video {n}"),
                description: String::new(),
                published_at: Utc.with_ymd_and_hms(2024, 6, n, 0, 0, 0).single().unwrap(),
                likes: self.likes,
                views: 10 * self.likes,
                comments: 0,
            };
            Ok(VideoPage {
                videos: vec![video(2), video(1)],
                next_page_token: None,
            })
        }
    }

    /// Store whose uploads fail for names in `reject`.
    struct RejectingStore {
        inner: LocalSnapshotStore,
        reject: HashSet<String>,
    }

    #[async_trait]
    impl SnapshotStore for RejectingStore {
        fn describe(&self) -> String {
            "rejecting".into()
        }

        async fn put(&self, name: &str, bytes: &[u8]) -> Result<StoredSnapshot, SnapshotStoreError> {
            if self.reject.contains(name) {
                return Err(SnapshotStoreError::HttpStatus {
                    name: name.to_string(),
                    status: 503,
                });
            }
            self.inner.put(name, bytes).await
        }

        async fn get(&self, name: &str) -> Result<Vec<u8>, SnapshotStoreError> {
            self.inner.get(name).await
        }
    }

    fn channels() -> Vec<ChannelSource> {
        vec![
            ChannelSource::new("UC_A", "alpha", "Alpha"),
            ChannelSource::new("UC_B", "beta", "Beta Channel"),
        ]
    }

    fn pipeline(
        platform: FakePlatform,
        store: Arc<dyn SnapshotStore>,
        catalog: Arc<MemoryCatalog>,
    ) -> SyncPipeline {
        SyncPipeline::new(channels(), Arc::new(platform), store, catalog.clone(), catalog)
    }

    #[tokio::test]
    async fn full_run_writes_snapshots_and_one_success_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(dir.path()));
        let catalog = Arc::new(MemoryCatalog::new());
        let pipeline = pipeline(FakePlatform { likes: 5, ..Default::default() }, store, catalog.clone());

        let report = pipeline.run(RunScope::Full).await;
        assert_eq!(report.status(), RunStatus::Success, "{:?}", report.failures);
        assert_eq!(report.snapshots_written, 4);
        assert_eq!(report.files_reconciled, 4);
        assert_eq!(report.totals, ReconcileCounts::new(4, 0));
        assert!(dir.path().join("Beta Channel_channel_data.csv").is_file());
        assert!(dir.path().join("beta_data.csv").is_file());

        assert_eq!(catalog.channel("UC_B").await.unwrap().channel_name, "Beta Channel");
        assert_eq!(catalog.video_count().await, 4);

        let tasks = catalog.import_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task.status, RunStatus::Success);
        assert_eq!(tasks[0].task.created_videos, 4);
        assert_eq!(tasks[0].task.error_summary, None);
        assert!(tasks[0].task.date_start <= tasks[0].task.date_end);
        assert_eq!(report.import_task_id, Some(tasks[0].id));
    }

    #[tokio::test]
    async fn second_run_reports_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(dir.path()));
        let catalog = Arc::new(MemoryCatalog::new());

        pipeline(FakePlatform { likes: 1, ..Default::default() }, store.clone(), catalog.clone())
            .run(RunScope::Full)
            .await;
        let report = pipeline(FakePlatform { likes: 7, ..Default::default() }, store, catalog.clone())
            .run(RunScope::Full)
            .await;

        assert_eq!(report.totals, ReconcileCounts::new(0, 4));
        assert_eq!(catalog.video("UC_A-v1").await.unwrap().likes, 7);
        assert_eq!(catalog.import_tasks().await.len(), 2);
    }

    #[tokio::test]
    async fn api_error_for_one_channel_fails_the_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(dir.path()));
        let catalog = Arc::new(MemoryCatalog::new());
        let platform = FakePlatform {
            failing: HashSet::from(["UC_A".to_string()]),
            likes: 3,
        };

        let report = pipeline(platform, store, catalog.clone()).run(RunScope::Full).await;

        assert_eq!(report.status(), RunStatus::Failed);
        // UC_A's snapshots were never written, so fetch plus two downloads fail.
        let stages: Vec<_> = report.failures.iter().map(|f| f.stage).collect();
        assert_eq!(stages, vec![RunStage::Fetch, RunStage::Download, RunStage::Download]);
        assert_eq!(report.failures[0].target, "UC_A");

        // UC_B still went through end to end.
        assert_eq!(report.totals, ReconcileCounts::new(2, 0));
        assert!(catalog.channel("UC_B").await.is_some());

        let tasks = catalog.import_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task.status, RunStatus::Failed);
        let summary = tasks[0].task.error_summary.as_deref().unwrap();
        assert!(summary.contains("UC_A"));
        assert!(summary.contains("quotaExceeded"));
    }

    #[tokio::test]
    async fn upload_failure_is_recorded_and_other_channels_continue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RejectingStore {
            inner: LocalSnapshotStore::new(dir.path()),
            reject: HashSet::from(["alpha_data.csv".to_string()]),
        });
        let catalog = Arc::new(MemoryCatalog::new());

        let report = pipeline(FakePlatform::default(), store, catalog.clone())
            .run(RunScope::Retrieve)
            .await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, RunStage::Upload);
        assert_eq!(report.snapshots_written, 2);
        assert_eq!(report.files_reconciled, 0);

        let tasks = catalog.import_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].task.created_videos, tasks[0].task.updated_videos), (0, 0));
    }

    #[tokio::test]
    async fn bad_file_does_not_stop_remaining_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(dir.path()));
        let catalog = Arc::new(MemoryCatalog::new());
        let pipeline = pipeline(FakePlatform::default(), store.clone(), catalog.clone());

        pipeline.run(RunScope::Retrieve).await;
        store
            .put("alpha_data.csv", b"videoId,title\nbroken,row\n")
            .await
            .unwrap();

        let report = pipeline.run(RunScope::Process).await;
        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, RunStage::Reconcile);
        assert_eq!(report.failures[0].target, "alpha_data.csv");
        assert_eq!(report.files_reconciled, 3);
        assert_eq!(report.totals, ReconcileCounts::new(2, 0));

        let tasks = catalog.import_tasks().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].task.status, RunStatus::Failed);
        assert_eq!(tasks[1].task.created_videos, 2);
    }

    #[tokio::test]
    async fn audit_failure_does_not_panic_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalSnapshotStore::new(dir.path()));
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_import_tasks(true).await;

        let report = pipeline(FakePlatform::default(), store, catalog.clone())
            .run(RunScope::Full)
            .await;
        assert_eq!(report.status(), RunStatus::Success);
        assert_eq!(report.import_task_id, None);
        assert_eq!(catalog.video_count().await, 4);
    }

    #[test]
    fn error_summary_joins_failures() {
        let now = Utc::now();
        let report = RunReport {
            run_id: Uuid::nil(),
            scope: RunScope::Process,
            started_at: now,
            finished_at: now,
            totals: ReconcileCounts::default(),
            snapshots_written: 0,
            files_reconciled: 0,
            failures: vec![
                RunFailure::new(RunStage::Fetch, "UC1", "boom"),
                RunFailure::new(RunStage::Reconcile, "a_data.csv", "bad row"),
            ],
            import_task_id: None,
        };
        assert_eq!(
            report.error_summary().as_deref(),
            Some("fetch UC1: boom; reconcile a_data.csv: bad row")
        );
        assert_eq!("process".parse::<RunScope>().unwrap(), RunScope::Process);
    }

    /// Three single-video pages chained by page tokens.
    struct PagedPlatform;

    #[async_trait]
    impl VideoPlatform for PagedPlatform {
        async fn fetch_channel_snapshot(
            &self,
            ctx: &FetchContext,
            channel_id: &str,
        ) -> Result<Option<ChannelRecord>, YouTubeError> {
            FakePlatform::default().fetch_channel_snapshot(ctx, channel_id).await
        }

        async fn fetch_video_page(
            &self,
            _ctx: &FetchContext,
            channel_id: &str,
            page_token: Option<&str>,
        ) -> Result<VideoPage, YouTubeError> {
            let (day, next) = match page_token {
                None => (3, Some("p2")),
                Some("p2") => (2, Some("p3")),
                _ => (1, None),
            };
            Ok(VideoPage {
                videos: vec![VideoRecord {
                    video_id: format!("{channel_id}-v{day}"),
                    title: format!("video {day}"),
                    description: String::new(),
                    published_at: Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).single().unwrap(),
                    likes: 1,
                    views: 1,
                    comments: 0,
                }],
                next_page_token: next.map(str::to_string),
            })
        }
    }

    #[tokio::test]
    async fn video_pages_stream_into_one_snapshot_up_to_the_page_cap() {
        for (max_pages, expected) in [(Some(2), 2), (None, 3)] {
            let dir = tempfile::tempdir().unwrap();
            let catalog = Arc::new(MemoryCatalog::new());
            let pipeline = SyncPipeline::new(
                vec![ChannelSource::new("UC_P", "paged", "Paged")],
                Arc::new(PagedPlatform),
                Arc::new(LocalSnapshotStore::new(dir.path())),
                catalog.clone(),
                catalog.clone(),
            )
            .with_max_pages(max_pages);

            let report = pipeline.run(RunScope::Full).await;
            assert_eq!(report.status(), RunStatus::Success, "{:?}", report.failures);
            assert_eq!(catalog.video_count().await, expected, "max_pages {max_pages:?}");
            assert!(catalog.video("UC_P-v3").await.is_some());
        }
    }
}

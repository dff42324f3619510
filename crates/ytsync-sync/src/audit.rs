use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};
use ytsync_core::{ImportTask, RunStatus};

use crate::catalog::ImportTaskLog;
use crate::reconcile::ReconcileCounts;

/// Writes the single import_task row that closes a run. A failed insert is
/// logged and swallowed; there is no retry and no fallback path.
pub struct ImportAuditRecorder {
    log: Arc<dyn ImportTaskLog>,
}

impl ImportAuditRecorder {
    pub fn new(log: Arc<dyn ImportTaskLog>) -> Self {
        Self { log }
    }

    pub async fn record_run(
        &self,
        date_start: DateTime<Utc>,
        date_end: DateTime<Utc>,
        totals: ReconcileCounts,
        status: RunStatus,
        error_summary: Option<String>,
    ) -> Option<i64> {
        let task = ImportTask {
            date_start,
            date_end,
            created_videos: totals.created,
            updated_videos: totals.updated,
            status,
            error_summary,
        };
        match self.log.insert_import_task(&task).await {
            Ok(id) => {
                info!(
                    import_task_id = id,
                    status = %status,
                    created = totals.created,
                    updated = totals.updated,
                    "import task recorded"
                );
                Some(id)
            }
            Err(err) => {
                error!(error = %err, status = %status, "failed to record import task");
                None
            }
        }
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::{DailyTime, SyncConfig};
use crate::pipeline::{RunScope, SyncPipeline};

/// Two daily UTC jobs: retrieval at `RETRIEVAL_AT`, processing at
/// `PROCESSING_AT`. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(config.retrieval_at, config.processing_at, pipeline)
        .await
        .map(Some)
}

pub async fn build_scheduler(
    retrieval_at: DailyTime,
    processing_at: DailyTime,
    pipeline: Arc<SyncPipeline>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (at, scope) in [
        (retrieval_at, RunScope::Retrieve),
        (processing_at, RunScope::Process),
    ] {
        let cron = at.cron();
        let pipeline = pipeline.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                info!(%scope, "scheduled run triggered");
                pipeline.run(scope).await;
            })
        })
        .with_context(|| format!("creating {scope} job for {at} UTC ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%scope, at = %at, "scheduled daily run");
    }
    Ok(sched)
}

/// Starts the scheduler and blocks until ctrl-c.
pub async fn run_until_shutdown(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use ytsync_core::RunStatus;
use ytsync_sync::schedule::{build_scheduler, maybe_build_scheduler, run_until_shutdown};
use ytsync_sync::{RunReport, RunScope};

#[derive(Debug, Parser)]
#[command(name = "ytsync")]
#[command(about = "YouTube channel snapshot sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Retrieve snapshots and reconcile them in one run.
    Run,
    Retrieve,
    Process,
    /// Create the channel, video and import_task tables.
    Migrate,
    /// Serve the HTTP triggers (and the daily scheduler when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run only the daily scheduler until ctrl-c.
    Schedule,
    /// Print the most recent import_task rows.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn run_scope(scope: RunScope) -> Result<()> {
    let ctx = ytsync_sync::context_from_env().await?;
    let report = ctx.pipeline.run(scope).await;
    print_report(&report);
    if report.status() == RunStatus::Failed {
        bail!("{scope} run failed with {} error(s)", report.failures.len());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{} run {}: status={} created={} updated={} snapshots_written={} files_reconciled={} import_task={}",
        report.scope,
        report.run_id,
        report.status(),
        report.totals.created,
        report.totals.updated,
        report.snapshots_written,
        report.files_reconciled,
        report
            .import_task_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "not recorded".into()),
    );
    for failure in &report.failures {
        println!("  {failure}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Run => run_scope(RunScope::Full).await?,
        Commands::Retrieve => run_scope(RunScope::Retrieve).await?,
        Commands::Process => run_scope(RunScope::Process).await?,
        Commands::Migrate => {
            let catalog = ytsync_sync::catalog_from_env().await?;
            catalog.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let ctx = ytsync_sync::context_from_env().await?;
            let port = port.unwrap_or(ctx.config.port);
            let scheduler = maybe_build_scheduler(&ctx.config, ctx.pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await?;
                info!("daily scheduler started");
            }
            ytsync_web::serve(ctx.pipeline, port).await?;
        }
        Commands::Schedule => {
            let ctx = ytsync_sync::context_from_env().await?;
            let sched = build_scheduler(
                ctx.config.retrieval_at,
                ctx.config.processing_at,
                ctx.pipeline.clone(),
            )
            .await?;
            run_until_shutdown(sched).await?;
        }
        Commands::History { limit } => {
            let catalog = ytsync_sync::catalog_from_env().await?;
            for entry in catalog.recent_import_tasks(limit).await? {
                let task = entry.task;
                println!(
                    "{} {} -> {} status={} created={} updated={}{}",
                    entry.id,
                    task.date_start.to_rfc3339(),
                    task.date_end.to_rfc3339(),
                    task.status,
                    task.created_videos,
                    task.updated_videos,
                    task.error_summary
                        .as_deref()
                        .map(|s| format!(" errors: {s}"))
                        .unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

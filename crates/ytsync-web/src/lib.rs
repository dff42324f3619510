//! HTTP trigger surface for the sync pipeline.
//!
//! Trigger routes run synchronously and always answer with their generic
//! completion text; the real outcome is in the import_task table and the logs.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use ytsync_sync::{RunReport, RunScope, SyncPipeline};

pub const CRATE_NAME: &str = "ytsync-web";

pub const FULL_RUN_MESSAGE: &str = "Data retrieval and processing complete";
pub const RETRIEVAL_MESSAGE: &str = "Data retrieval complete";
pub const PROCESSING_MESSAGE: &str = "Data processing complete";

pub struct AppState {
    pipeline: Arc<SyncPipeline>,
    last_report: Mutex<Option<RunReport>>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            last_report: Mutex::new(None),
        }
    }

    async fn trigger(&self, scope: RunScope) {
        let report = self.pipeline.run(scope).await;
        *self.last_report.lock().await = Some(report);
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(full_run_handler))
        .route("/retrieve", get(retrieve_handler))
        .route("/process", get(process_handler))
        .route("/runs/latest", get(latest_run_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn full_run_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.trigger(RunScope::Full).await;
    FULL_RUN_MESSAGE
}

async fn retrieve_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.trigger(RunScope::Retrieve).await;
    RETRIEVAL_MESSAGE
}

async fn process_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.trigger(RunScope::Process).await;
    PROCESSING_MESSAGE
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_report.lock().await.as_ref() {
        Some(report) => Json(report.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no run since startup").into_response(),
    }
}

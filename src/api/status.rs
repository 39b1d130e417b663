//! Read-only inspection of the active digest run, falling back to the most
//! recently finished one.

use anyhow::Result;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::app::AppState;
use crate::clients::notifier::DigestGroup;
use crate::pipeline::Orchestrator;
use crate::pipeline::finalize::group_items;
use crate::store::models::{Job, JobStatus};

#[derive(Debug, Serialize)]
struct StatusResponse {
    job_id: Uuid,
    status: JobStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    discovery_targets_total: u32,
    discovery_targets_complete: u32,
    fetch_targets_total: u32,
    fetch_targets_complete: u32,
    total_new_items: u32,
    notification_sent: bool,
    discovery_queue_len: u64,
    fetch_queue_len: u64,
    ledger_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    job_id: Uuid,
    status: JobStatus,
    item_count: usize,
    groups: Vec<DigestGroup>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn current(State(state): State<AppState>) -> Response {
    let orchestrator = state.orchestrator();
    let job = match inspectable_job(orchestrator).await {
        Ok(Some(job)) => job,
        Ok(None) => return no_job_on_record(),
        Err(error) => return internal_error(&error),
    };
    match snapshot(orchestrator, job).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => internal_error(&error),
    }
}

pub(crate) async fn preview(State(state): State<AppState>) -> Response {
    let orchestrator = state.orchestrator();
    let job = match inspectable_job(orchestrator).await {
        Ok(Some(job)) => job,
        Ok(None) => return no_job_on_record(),
        Err(error) => return internal_error(&error),
    };
    match orchestrator.jobs().load_items(job.id).await {
        Ok(items) => (
            StatusCode::OK,
            Json(PreviewResponse {
                job_id: job.id,
                status: job.status,
                item_count: items.len(),
                groups: group_items(&items),
            }),
        )
            .into_response(),
        Err(error) => internal_error(&error),
    }
}

/// The job worth showing: the active one when a run is underway, otherwise
/// whatever the last-job pointer still resolves to.
async fn inspectable_job(orchestrator: &Orchestrator) -> Result<Option<Job>> {
    let jobs = orchestrator.jobs();
    if let Some(id) = jobs.active_job_id().await? {
        if let Some(job) = jobs.load_job(id).await? {
            return Ok(Some(job));
        }
    }
    let Some(id) = jobs.last_job_id().await? else {
        return Ok(None);
    };
    jobs.load_job(id).await
}

async fn snapshot(orchestrator: &Orchestrator, job: Job) -> Result<StatusResponse> {
    let jobs = orchestrator.jobs();
    let discovery_queue_len = jobs.discovery_queue_len(job.id).await?;
    let fetch_queue_len = jobs.fetch_queue_len(job.id).await?;
    let ledger_size = orchestrator.ledger().size().await?;
    let last_run = orchestrator.ledger().last_run().await?;
    Ok(StatusResponse {
        job_id: job.id,
        status: job.status,
        started_at: job.started_at,
        updated_at: job.updated_at,
        completed_at: job.completed_at,
        error: job.error,
        discovery_targets_total: job.discovery_targets_total,
        discovery_targets_complete: job.discovery_targets_complete,
        fetch_targets_total: job.fetch_targets_total,
        fetch_targets_complete: job.fetch_targets_complete,
        total_new_items: job.total_new_items,
        notification_sent: job.notification_sent,
        discovery_queue_len,
        fetch_queue_len,
        ledger_size,
        last_run,
    })
}

fn no_job_on_record() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "no digest job on record".to_string(),
        }),
    )
        .into_response()
}

fn internal_error(error: &anyhow::Error) -> Response {
    error!(error = ?error, "status lookup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{error:#}"),
        }),
    )
        .into_response()
}

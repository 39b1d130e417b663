//! Operator-facing reset of job state.
//!
//! The plain reset deletes jobs, queues and pointers so a wedged run can be
//! retried; the extended form also wipes the dedup ledger, after which every
//! previously digested item becomes eligible again.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ResetParams {
    #[serde(default)]
    extended: bool,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    deleted_keys: u64,
    extended: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn reset(
    State(state): State<AppState>,
    Query(params): Query<ResetParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(error) = state
        .authenticator()
        .verify_trigger(&headers, params.token.as_deref())
    {
        warn!(error = %error, "rejected admin reset");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: error.to_string(),
            }),
        )
            .into_response();
    }
    state
        .telemetry()
        .record_admin_reset_invocation(params.extended);

    let orchestrator = state.orchestrator();
    let deleted_keys = match orchestrator.jobs().delete_job_keys().await {
        Ok(count) => count,
        Err(error) => return internal_error(&error),
    };
    if params.extended {
        if let Err(error) = orchestrator.ledger().clear().await {
            return internal_error(&error);
        }
    }
    (
        StatusCode::OK,
        Json(ResetResponse {
            deleted_keys,
            extended: params.extended,
        }),
    )
        .into_response()
}

fn internal_error(error: &anyhow::Error) -> Response {
    error!(error = ?error, "admin reset failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{error:#}"),
        }),
    )
        .into_response()
}

//! Entry point for a digest run, called by an external timer or operator.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::pipeline::launch::{LaunchOutcome, Launcher};

#[derive(Debug, Deserialize)]
pub(crate) struct TriggerParams {
    #[serde(default)]
    force: bool,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: Uuid,
    message_id: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RefusedResponse {
    active_job_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn run(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
    headers: HeaderMap,
) -> Response {
    state.telemetry().record_trigger_invocation(params.force);

    if let Err(error) = state
        .authenticator()
        .verify_trigger(&headers, params.token.as_deref())
    {
        warn!(error = %error, "rejected digest trigger");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: error.to_string(),
            }),
        )
            .into_response();
    }

    match Launcher::new(state.orchestrator()).launch(params.force).await {
        Ok(LaunchOutcome::Started { job_id, message_id }) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                job_id,
                message_id,
                status: "started",
            }),
        )
            .into_response(),
        Ok(LaunchOutcome::Refused { active_job_id }) => (
            StatusCode::CONFLICT,
            Json(RefusedResponse {
                active_job_id,
                status: "already_running",
            }),
        )
            .into_response(),
        Err(error) => {
            error!(error = ?error, "digest trigger failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("{error:#}"),
                }),
            )
                .into_response()
        }
    }
}

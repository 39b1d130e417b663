//! Phase callback endpoints, invoked by the push relay.
//!
//! Every outcome the pipeline can absorb is answered with 200 so the relay
//! stops redelivering, including failed batches and stale duplicates. Only
//! unverified callers and infrastructure errors are surfaced as HTTP
//! failures.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::pipeline::Phase;

#[derive(Debug, Deserialize)]
struct PhaseCallback {
    job_id: Uuid,
    #[serde(default)]
    batch_index: u32,
}

#[derive(Debug, Serialize)]
struct PhaseReply {
    job_id: Uuid,
    phase: &'static str,
    outcome: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn discover(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, Phase::Discover, &headers, &body).await
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, Phase::Fetch, &headers, &body).await
}

pub(crate) async fn finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, Phase::Finalize, &headers, &body).await
}

async fn handle(state: AppState, phase: Phase, headers: &HeaderMap, body: &Bytes) -> Response {
    let caller = match state.authenticator().verify_phase(headers, body) {
        Ok(caller) => caller,
        Err(error) => {
            warn!(phase = phase.as_str(), error = %error, "rejected phase callback");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: error.to_string(),
                }),
            )
                .into_response();
        }
    };

    let callback: PhaseCallback = match serde_json::from_slice(body) {
        Ok(callback) => callback,
        Err(error) => {
            warn!(phase = phase.as_str(), error = %error, "unreadable phase callback");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("invalid callback body: {error}"),
                }),
            )
                .into_response();
        }
    };

    info!(
        phase = phase.as_str(),
        job_id = %callback.job_id,
        batch_index = callback.batch_index,
        caller = ?caller,
        "phase callback received"
    );

    match state.orchestrator().run_phase(phase, callback.job_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(PhaseReply {
                job_id: callback.job_id,
                phase: phase.as_str(),
                outcome: outcome.as_str(),
            }),
        )
            .into_response(),
        Err(error) => {
            error!(
                phase = phase.as_str(),
                job_id = %callback.job_id,
                error = ?error,
                "phase invocation hit an infrastructure error"
            );
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

pub(crate) mod admin;
pub(crate) mod auth;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod phases;
pub(crate) mod status;
pub(crate) mod trigger;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/v1/phase/discover", post(phases::discover))
        .route("/v1/phase/fetch", post(phases::fetch))
        .route("/v1/phase/finalize", post(phases::finalize))
        .route("/v1/digest/trigger", get(trigger::run))
        .route("/v1/digest/status", get(status::current))
        .route("/v1/digest/preview", get(status::preview))
        .route("/v1/admin/reset", post(admin::reset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
